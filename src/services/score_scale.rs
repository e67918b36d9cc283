/// Maps a 0-10 score to the reported 1-7 scale. Never goes below 1.0.
pub(crate) fn to_final_scale(score: f64) -> f64 {
    ((score / 10.0) * 6.0 + 1.0).max(1.0)
}

pub(crate) fn round_one_decimal(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
