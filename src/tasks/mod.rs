pub(crate) mod evaluation;
