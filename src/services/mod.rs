pub(crate) mod file_fetcher;
pub(crate) mod rubric_scoring;
pub(crate) mod score_scale;
pub(crate) mod storage;
pub(crate) mod text_normalizer;
pub(crate) mod vision_ocr;
