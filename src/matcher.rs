use crate::models::{Account, TimeOfDay, Weekday};
use std::collections::HashMap;

/// Flat filter over the account table: which drivers are eligible for a
/// request in `area` on `day` at `time` carrying `min_rating`?
///
/// A driver matches when all of:
///   - the driver flag is set
///   - the area is an exact string match
///   - the driver's passenger-rating floor is at or below the request's
///   - the driver's window for `day` has `time` equal to either endpoint
///
/// The time test is endpoint equality, NOT interval containment — that is
/// the known-good legacy behavior, kept on purpose. No ranking, no
/// distance: the result is the unordered set of matches, sorted only so the
/// fan-out is deterministic.
pub fn eligible_drivers(
    accounts: &HashMap<String, Account>,
    area: &str,
    day: Weekday,
    time: TimeOfDay,
    min_rating: f64,
) -> Vec<String> {
    let mut matched: Vec<String> = accounts
        .values()
        .filter(|acc| acc.is_driver)
        .filter(|acc| acc.area == area)
        .filter(|acc| acc.min_passenger_rating <= min_rating)
        .filter(|acc| match acc.availability.get(&day) {
            Some(Some(w)) => w.from == time || w.to == time,
            _ => false,
        })
        .map(|acc| acc.username.clone())
        .collect();
    matched.sort();
    matched
}
