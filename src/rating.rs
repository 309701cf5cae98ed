use crate::models::RatingAggregate;

pub const MIN_RATING: f64 = 0.0;
pub const MAX_RATING: f64 = 5.0;

/// Fold one rating into a running average. The raw value is clamped to
/// [0, 5] before averaging and the stored average is kept at two decimal
/// places. Plain incremental mean: no decay, no outlier rejection, no
/// minimum sample size.
pub fn apply(agg: &mut RatingAggregate, raw: f64) -> f64 {
    let clamped = raw.clamp(MIN_RATING, MAX_RATING);
    let total = agg.average * f64::from(agg.count) + clamped;
    let average = total / f64::from(agg.count + 1);
    agg.average = (average * 100.0).round() / 100.0;
    agg.count += 1;
    agg.average
}
