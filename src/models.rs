use crate::error::BrokerError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

// ── Weekday ──────────────────────────────────────────────────────────────────
// Availability keys and request days. Parsing is tolerant the way the legacy
// clients are: "mon", "Monday" and "MONDAY" all mean the same thing.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Weekday {
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
    Sunday,
}

impl Weekday {
    pub const ALL: [Weekday; 7] = [
        Weekday::Monday,
        Weekday::Tuesday,
        Weekday::Wednesday,
        Weekday::Thursday,
        Weekday::Friday,
        Weekday::Saturday,
        Weekday::Sunday,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Weekday::Monday => "monday",
            Weekday::Tuesday => "tuesday",
            Weekday::Wednesday => "wednesday",
            Weekday::Thursday => "thursday",
            Weekday::Friday => "friday",
            Weekday::Saturday => "saturday",
            Weekday::Sunday => "sunday",
        }
    }
}

impl FromStr for Weekday {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "mon" | "monday" => Ok(Weekday::Monday),
            "tue" | "tues" | "tuesday" => Ok(Weekday::Tuesday),
            "wed" | "wednesday" => Ok(Weekday::Wednesday),
            "thu" | "thurs" | "thursday" => Ok(Weekday::Thursday),
            "fri" | "friday" => Ok(Weekday::Friday),
            "sat" | "saturday" => Ok(Weekday::Saturday),
            "sun" | "sunday" => Ok(Weekday::Sunday),
            _ => Err(BrokerError::InvalidDay),
        }
    }
}

impl fmt::Display for Weekday {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Time of day ──────────────────────────────────────────────────────────────
// Compared numerically so "8:00" and "08:00" are the same instant. Matching
// is endpoint equality against an availability window, never containment, so
// ordering comparisons are deliberately absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeOfDay {
    pub hour: u8,
    pub minute: u8,
}

impl TimeOfDay {
    pub fn new(hour: u8, minute: u8) -> Result<Self, BrokerError> {
        if hour > 23 || minute > 59 {
            return Err(BrokerError::invalid("Invalid time of day."));
        }
        Ok(TimeOfDay { hour, minute })
    }
}

impl FromStr for TimeOfDay {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (h, m) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| BrokerError::invalid("Invalid time of day."))?;
        let hour: u8 = h
            .parse()
            .map_err(|_| BrokerError::invalid("Invalid time of day."))?;
        let minute: u8 = m
            .parse()
            .map_err(|_| BrokerError::invalid("Invalid time of day."))?;
        TimeOfDay::new(hour, minute)
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

impl TryFrom<String> for TimeOfDay {
    type Error = BrokerError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<TimeOfDay> for String {
    fn from(t: TimeOfDay) -> String {
        t.to_string()
    }
}

/// One day's commute window. The legacy wire shape is
/// `{"from":"08:00","to":"17:30"}`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub from: TimeOfDay,
    pub to: TimeOfDay,
}

// ── Ratings ──────────────────────────────────────────────────────────────────
/// Running mean over all ratings received. Starts at 5.0 with count 0 to
/// match the legacy client defaults; the first real rating replaces the
/// synthetic average because the count is zero.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RatingAggregate {
    pub average: f64,
    pub count: u32,
}

impl Default for RatingAggregate {
    fn default() -> Self {
        RatingAggregate {
            average: 5.0,
            count: 0,
        }
    }
}

// ── Ride request lifecycle ───────────────────────────────────────────────────
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Active,
    Completed,
}

/// One passenger ask, broadcast by id into every matched driver's queue.
/// The id is generated once and copied verbatim into each copy — that shared
/// id is what the accept race is resolved against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RideRequest {
    pub id: String,
    pub passenger: String,
    pub area: String,
    pub day: Weekday,
    pub time: TimeOfDay,
    pub min_driver_rating: f64,
    pub status: RequestStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accepted_by: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RideStatus {
    Active,
    Completed,
}

/// Passenger-facing projection of an accepted request. Lives in the
/// passenger's active list until completion, then in the completed list until
/// the passenger rates the driver for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ride {
    pub id: String,
    pub driver: String,
    pub passenger: String,
    pub area: String,
    pub day: Weekday,
    pub time: TimeOfDay,
    pub status: RideStatus,
}

// ── Chat ─────────────────────────────────────────────────────────────────────
/// Immutable per-ride chat record. `seq` is the insertion index within the
/// ride's log (monotonic). The sender's display name is NOT stored here — it
/// is resolved at read time so renames show up retroactively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub ride_id: String,
    pub sender: String,
    pub recipient: String,
    pub text: String,
    pub seq: usize,
    pub sent_at: String,
}

// ── Account ──────────────────────────────────────────────────────────────────
/// One record per user. The driver queue and the passenger's ride
/// projections are embedded collections — the store is one record per
/// account, so every lifecycle transition is a read-modify-write of one or
/// more of these records under the broker lock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub username: String,
    pub full_name: String,
    pub email: String,
    pub password: String,
    pub area: String,
    pub is_driver: bool,
    /// Lowest passenger rating this driver will accept requests from.
    pub min_passenger_rating: f64,
    pub driver_rating: RatingAggregate,
    pub passenger_rating: RatingAggregate,
    /// Weekly commute windows, one optional entry per weekday.
    pub availability: BTreeMap<Weekday, Option<TimeWindow>>,
    /// Driver queue: copies of broadcast requests awaiting or held by this
    /// driver.
    pub pending_requests: Vec<RideRequest>,
    pub active_rides: Vec<Ride>,
    pub completed_rides: Vec<Ride>,
}

impl Account {
    pub fn new(
        username: &str,
        full_name: &str,
        email: &str,
        password: &str,
        area: &str,
        is_driver: bool,
    ) -> Self {
        let availability = Weekday::ALL.iter().map(|d| (*d, None)).collect();
        Account {
            username: username.to_string(),
            full_name: full_name.to_string(),
            email: email.to_string(),
            password: password.to_string(),
            area: area.to_string(),
            is_driver,
            min_passenger_rating: 0.0,
            driver_rating: RatingAggregate::default(),
            passenger_rating: RatingAggregate::default(),
            availability,
            pending_requests: Vec::new(),
            active_rides: Vec::new(),
            completed_rides: Vec::new(),
        }
    }
}
