//! One handler per wire command. Each handler validates its own argument
//! arity and formats, runs the operation under the broker lock where a
//! mutation is involved, and produces the legacy response string the GUI
//! clients parse. Typed failures bubble up as `BrokerError`; the commands
//! whose legacy contract is a bare string ("Request not found.", "Invalid
//! request index.") translate those failures here instead.

use crate::error::BrokerError;
use crate::lifecycle;
use crate::models::{TimeOfDay, TimeWindow, Weekday};
use crate::state::Brokerage;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde_json::{json, Value};

const MAX_USERNAME_LEN: usize = 128;
const MAX_TEXT_LEN: usize = 65_536; // 64 KB decoded chat text

// ── Argument helpers ─────────────────────────────────────────────────────────
fn expect_args<'a, const N: usize>(args: &[&'a str]) -> Result<[&'a str; N], BrokerError> {
    args.try_into().map_err(|_| {
        BrokerError::invalid(format!("Malformed command: expected {N} field(s)."))
    })
}

fn validate_username(name: &str) -> Result<(), BrokerError> {
    if name.trim().is_empty() {
        return Err(BrokerError::invalid("Username must not be empty."));
    }
    if name.len() > MAX_USERNAME_LEN {
        return Err(BrokerError::invalid(format!(
            "Username exceeds {MAX_USERNAME_LEN} character limit."
        )));
    }
    if name.chars().any(char::is_control) {
        return Err(BrokerError::invalid(
            "Username must not contain control characters.",
        ));
    }
    Ok(())
}

fn parse_rating(raw: &str) -> Result<f64, BrokerError> {
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|r| r.is_finite())
        .ok_or_else(|| BrokerError::invalid("Invalid rating."))
}

fn parse_flag(raw: &str) -> Result<bool, BrokerError> {
    match raw.trim() {
        "1" => Ok(true),
        "0" => Ok(false),
        _ => Err(BrokerError::invalid("Invalid driver flag.")),
    }
}

// Times travel as separate hour and minute fields — "08:00" would split on
// the protocol's own delimiter.
fn parse_time_fields(hour: &str, minute: &str) -> Result<TimeOfDay, BrokerError> {
    let hour: u8 = hour
        .trim()
        .parse()
        .map_err(|_| BrokerError::invalid("Invalid time of day."))?;
    let minute: u8 = minute
        .trim()
        .parse()
        .map_err(|_| BrokerError::invalid("Invalid time of day."))?;
    TimeOfDay::new(hour, minute)
}

// ── Account commands ─────────────────────────────────────────────────────────
// register:<username>:<full_name>:<email>:<password>:<area>:<is_driver>
pub fn register(state: &Brokerage, args: &[&str]) -> Result<String, BrokerError> {
    let [username, full_name, email, password, area, is_driver] = expect_args(args)?;
    validate_username(username)?;
    if password.is_empty() {
        return Err(BrokerError::invalid("Password must not be empty."));
    }
    let is_driver = parse_flag(is_driver)?;

    let mut accounts = state.accounts();
    if accounts.contains_key(username) {
        return Err(BrokerError::invalid("Username already exists."));
    }
    accounts.insert(
        username.to_string(),
        crate::models::Account::new(username, full_name, email, password, area, is_driver),
    );
    state.persist_accounts(&accounts);
    tracing::info!(username, is_driver, "account registered");
    Ok("User registered successfully.".to_string())
}

// login:<username>:<password>
//
// The success payload is the flattened profile line the legacy GUI splits on
// colons: full name, email, area, driver flag, rating fields, the pending
// request ids as csv, then seven availability fields in weekday order (each
// either `[]` or `{"from":"HH:MM","to":"HH:MM"}`).
pub fn login(state: &Brokerage, args: &[&str]) -> Result<String, BrokerError> {
    let [username, password] = expect_args(args)?;

    let accounts = state.accounts();
    let acc = accounts.get(username).ok_or(BrokerError::UnknownAccount)?;
    if acc.password != password {
        return Err(BrokerError::invalid("Incorrect password."));
    }

    let pending_csv = acc
        .pending_requests
        .iter()
        .map(|r| r.id.as_str())
        .collect::<Vec<_>>()
        .join(",");
    let availability = Weekday::ALL
        .iter()
        .map(|day| match acc.availability.get(day) {
            Some(Some(w)) => serde_json::to_string(w).unwrap_or_else(|_| "[]".to_string()),
            _ => "[]".to_string(),
        })
        .collect::<Vec<_>>()
        .join(":");

    Ok(format!(
        "success:{}:{}:{}:{}:{}:{}:{}:{}:{}",
        acc.full_name,
        acc.email,
        acc.area,
        u8::from(acc.is_driver),
        acc.min_passenger_rating,
        acc.passenger_rating.average,
        acc.driver_rating.average,
        pending_csv,
        availability,
    ))
}

// editprofile:<username>:<full_name>:<area>:<is_driver>
pub fn edit_profile(state: &Brokerage, args: &[&str]) -> Result<String, BrokerError> {
    let [username, full_name, area, is_driver] = expect_args(args)?;
    let is_driver = parse_flag(is_driver)?;

    let mut accounts = state.accounts();
    let acc = accounts
        .get_mut(username)
        .ok_or(BrokerError::UnknownAccount)?;
    acc.full_name = full_name.to_string();
    acc.area = area.to_string();
    acc.is_driver = is_driver;
    state.persist_accounts(&accounts);
    Ok("Profile updated successfully.".to_string())
}

// set_availability:<username>:<day>:<from_h>:<from_m>:<to_h>:<to_m>:<min_rating>
//
// The dashboard collects one day's commute window together with the driver's
// passenger-rating floor, so both land in one command.
pub fn set_availability(state: &Brokerage, args: &[&str]) -> Result<String, BrokerError> {
    let [username, day, from_h, from_m, to_h, to_m, min_rating] = expect_args(args)?;
    let day: Weekday = day.parse()?;
    let window = TimeWindow {
        from: parse_time_fields(from_h, from_m)?,
        to: parse_time_fields(to_h, to_m)?,
    };
    let floor = parse_rating(min_rating)?.clamp(crate::rating::MIN_RATING, crate::rating::MAX_RATING);

    let mut accounts = state.accounts();
    let acc = accounts
        .get_mut(username)
        .ok_or(BrokerError::UnknownAccount)?;
    if !acc.is_driver {
        return Err(BrokerError::NotDriver);
    }
    acc.availability.insert(day, Some(window));
    acc.min_passenger_rating = floor;
    state.persist_accounts(&accounts);
    Ok("Availability saved.".to_string())
}

// ── Lifecycle commands ───────────────────────────────────────────────────────
// request_ride:<passenger>:<area>:<day>:<hour>:<minute>:<min_rating>
pub fn request_ride(state: &Brokerage, args: &[&str]) -> Result<String, BrokerError> {
    let [passenger, area, day, hour, minute, min_rating] = expect_args(args)?;
    let day: Weekday = day.parse()?;
    let time = parse_time_fields(hour, minute)?;
    let min_rating = parse_rating(min_rating)?;

    let mut accounts = state.accounts();
    let outcome =
        lifecycle::broadcast_request(&mut accounts, passenger, area, day, time, min_rating)?;
    if outcome.inserted == 0 {
        return Ok("No valid drivers found.".to_string());
    }
    state.persist_accounts(&accounts);

    // Best-effort fan-out: partial failures are reported, not fatal.
    if outcome.failed > 0 {
        Ok(format!(
            "Request added to {} driver(s). {} insertion(s) failed.",
            outcome.inserted, outcome.failed
        ))
    } else {
        Ok(format!("Request added to {} driver(s).", outcome.inserted))
    }
}

// get_pending:<driver>
pub fn get_pending(state: &Brokerage, args: &[&str]) -> Result<String, BrokerError> {
    let [driver] = expect_args(args)?;
    let accounts = state.accounts();
    let pending = lifecycle::pending_for(&accounts, driver)?;
    let payload = serde_json::to_string(&pending)
        .map_err(|e| BrokerError::Storage(e.to_string()))?;
    Ok(format!("success:{payload}"))
}

// accept_request:<driver>:<request_id>
pub fn accept_request(state: &Brokerage, args: &[&str]) -> Result<String, BrokerError> {
    let [driver, request_id] = expect_args(args)?;
    let mut accounts = state.accounts();
    match lifecycle::accept(&mut accounts, driver, request_id) {
        Ok(()) => {
            state.persist_accounts(&accounts);
            Ok("Request accepted.".to_string())
        }
        Err(BrokerError::UnknownRequest) => Ok("Request not found.".to_string()),
        Err(e) => Err(e),
    }
}

// end_request:<driver>:<request_id>
pub fn end_request(state: &Brokerage, args: &[&str]) -> Result<String, BrokerError> {
    let [driver, request_id] = expect_args(args)?;
    let mut accounts = state.accounts();
    match lifecycle::complete(&mut accounts, driver, request_id) {
        Ok(()) => {
            state.persist_accounts(&accounts);
            Ok("Request completed.".to_string())
        }
        Err(BrokerError::UnknownRequest) => Ok("Request not found.".to_string()),
        Err(e) => Err(e),
    }
}

// delete_request:<driver>:<index>
pub fn delete_request(state: &Brokerage, args: &[&str]) -> Result<String, BrokerError> {
    let [driver, index] = expect_args(args)?;
    let Ok(index) = index.trim().parse::<usize>() else {
        return Ok("Invalid request index.".to_string());
    };
    let mut accounts = state.accounts();
    match lifecycle::withdraw(&mut accounts, driver, index) {
        Ok(_removed) => {
            state.persist_accounts(&accounts);
            Ok("Request removed.".to_string())
        }
        Err(BrokerError::InvalidIndex) => Ok("Invalid request index.".to_string()),
        Err(e) => Err(e),
    }
}

// get_active_rides:<passenger> / get_completed_rides:<passenger>
//
// The GUI renders display names, so each ride carries `driver_name` resolved
// against the current account record at read time.
fn rides_payload(
    state: &Brokerage,
    passenger: &str,
    completed: bool,
) -> Result<String, BrokerError> {
    let accounts = state.accounts();
    let rides = if completed {
        lifecycle::completed_rides(&accounts, passenger)?
    } else {
        lifecycle::active_rides(&accounts, passenger)?
    };
    let payload: Vec<Value> = rides
        .iter()
        .map(|ride| {
            let driver_name = accounts
                .get(&ride.driver)
                .map(|acc| acc.full_name.clone())
                .unwrap_or_else(|| ride.driver.clone());
            let mut v = serde_json::to_value(ride).unwrap_or_else(|_| json!({}));
            v["driver_name"] = json!(driver_name);
            v
        })
        .collect();
    let payload =
        serde_json::to_string(&payload).map_err(|e| BrokerError::Storage(e.to_string()))?;
    Ok(format!("success:{payload}"))
}

pub fn get_active_rides(state: &Brokerage, args: &[&str]) -> Result<String, BrokerError> {
    let [passenger] = expect_args(args)?;
    rides_payload(state, passenger, false)
}

pub fn get_completed_rides(state: &Brokerage, args: &[&str]) -> Result<String, BrokerError> {
    let [passenger] = expect_args(args)?;
    rides_payload(state, passenger, true)
}

// ── Rating commands ──────────────────────────────────────────────────────────
// rate_driver_ride:<passenger>:<driver>:<request_id>:<rating>
pub fn rate_driver_ride(state: &Brokerage, args: &[&str]) -> Result<String, BrokerError> {
    let [passenger, driver, request_id, rating] = expect_args(args)?;
    let rating = parse_rating(rating)?;
    let mut accounts = state.accounts();
    let average =
        lifecycle::rate_driver_for_ride(&mut accounts, passenger, driver, request_id, rating)?;
    state.persist_accounts(&accounts);
    Ok(format!("Driver rated successfully. New average: {average}"))
}

// rate_passenger:<passenger>:<rating>
pub fn rate_passenger(state: &Brokerage, args: &[&str]) -> Result<String, BrokerError> {
    let [passenger, rating] = expect_args(args)?;
    let rating = parse_rating(rating)?;
    let mut accounts = state.accounts();
    let average = lifecycle::rate_passenger(&mut accounts, passenger, rating)?;
    state.persist_accounts(&accounts);
    Ok(format!("Passenger rated successfully. New average: {average}"))
}

// ── Chat commands ────────────────────────────────────────────────────────────
// send_message:<ride_id>:<sender>:<recipient>:<base64 text>
//
// The text rides the colon-delimited protocol base64-encoded so arbitrary
// content cannot break the framing.
pub fn send_message(state: &Brokerage, args: &[&str]) -> Result<String, BrokerError> {
    let [ride_id, sender, recipient, encoded] = expect_args(args)?;
    if ride_id.trim().is_empty() || sender.trim().is_empty() || recipient.trim().is_empty() {
        return Err(BrokerError::invalid("Invalid message payload."));
    }
    let decoded = BASE64
        .decode(encoded.trim())
        .map_err(|_| BrokerError::invalid("Invalid message payload."))?;
    let text = String::from_utf8(decoded)
        .map_err(|_| BrokerError::invalid("Invalid message payload."))?;
    if text.len() > MAX_TEXT_LEN {
        return Err(BrokerError::invalid("Message too long."));
    }

    state.append_chat(ride_id, sender, recipient, text);
    Ok("Message sent.".to_string())
}

// get_messages:<ride_id>
//
// Sender display names are resolved now, not at write time — a rename shows
// up retroactively in old messages.
pub fn get_messages(state: &Brokerage, args: &[&str]) -> Result<String, BrokerError> {
    let [ride_id] = expect_args(args)?;
    let log = state.chat_for(ride_id);

    let accounts = state.accounts();
    let payload: Vec<Value> = log
        .iter()
        .map(|msg| {
            let sender_name = accounts
                .get(&msg.sender)
                .map(|acc| acc.full_name.clone())
                .unwrap_or_else(|| msg.sender.clone());
            json!({
                "sender": msg.sender,
                "sender_name": sender_name,
                "recipient": msg.recipient,
                "message": msg.text,
                "timestamp": msg.sent_at,
                "seq": msg.seq,
            })
        })
        .collect();
    let payload =
        serde_json::to_string(&payload).map_err(|e| BrokerError::Storage(e.to_string()))?;
    Ok(format!("success:{payload}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Brokerage;
    use std::sync::{Arc, Barrier};
    use tempfile::TempDir;

    /// Helper: broker backed by a temp data directory.
    fn test_broker() -> (Brokerage, TempDir) {
        let dir = TempDir::new().unwrap();
        let broker = Brokerage::new(dir.path()).unwrap();
        (broker, dir)
    }

    fn add_driver(state: &Brokerage, name: &str, area: &str, day: &str, from: &str, to: &str) {
        register(state, &[name, name, "d@aub.edu", "pw", area, "1"]).unwrap();
        // windows arrive as separate hour/minute fields on the wire
        let (fh, fm) = from.split_once(':').unwrap();
        let (th, tm) = to.split_once(':').unwrap();
        set_availability(state, &[name, day, fh, fm, th, tm, "0"]).unwrap();
    }

    fn add_passenger(state: &Brokerage, name: &str) {
        register(state, &[name, name, "p@aub.edu", "pw", "Hamra", "0"]).unwrap();
    }

    /// Helper: pull the broadcast request id out of a driver's queue.
    fn pending_ids(state: &Brokerage, driver: &str) -> Vec<String> {
        let resp = get_pending(state, &[driver]).unwrap();
        let payload = resp.strip_prefix("success:").unwrap();
        let list: Vec<Value> = serde_json::from_str(payload).unwrap();
        list.iter()
            .map(|r| r["id"].as_str().unwrap().to_string())
            .collect()
    }

    // ── Accounts ────────────────────────────────────────────────────────────
    #[test]
    fn register_rejects_duplicate_usernames() {
        let (state, _dir) = test_broker();
        assert_eq!(
            register(&state, &["amin", "Amin S", "a@x", "pw", "Hamra", "1"]).unwrap(),
            "User registered successfully."
        );
        let err = register(&state, &["amin", "Other", "o@x", "pw", "Verdun", "0"]).unwrap_err();
        assert_eq!(err.to_string(), "Username already exists.");
    }

    #[test]
    fn register_validates_arity_and_flag() {
        let (state, _dir) = test_broker();
        assert!(register(&state, &["amin", "Amin"]).is_err());
        assert!(register(&state, &["amin", "Amin", "a@x", "pw", "Hamra", "yes"]).is_err());
        assert!(register(&state, &["", "Amin", "a@x", "pw", "Hamra", "1"]).is_err());
    }

    #[test]
    fn login_returns_the_flattened_legacy_profile() {
        let (state, _dir) = test_broker();
        add_driver(&state, "amin", "Hamra", "monday", "08:00", "17:00");

        let resp = login(&state, &["amin", "pw"]).unwrap();
        let parts: Vec<&str> = resp.splitn(10, ':').collect();
        assert_eq!(parts[0], "success");
        assert_eq!(parts[1], "amin"); // full name
        assert_eq!(parts[3], "Hamra");
        assert_eq!(parts[4], "1");
        // trailing section: pending csv + 7 availability fields
        let tail = parts[9];
        assert!(tail.contains(r#"{"from":"08:00","to":"17:00"}"#));
        assert_eq!(tail.matches("[]").count(), 6, "six empty weekdays");

        assert_eq!(
            login(&state, &["amin", "wrong"]).unwrap_err().to_string(),
            "Incorrect password."
        );
        assert_eq!(
            login(&state, &["ghost", "pw"]).unwrap_err(),
            BrokerError::UnknownAccount
        );
    }

    #[test]
    fn edit_profile_rewrites_fields() {
        let (state, _dir) = test_broker();
        add_passenger(&state, "pia");
        edit_profile(&state, &["pia", "Pia Haddad", "Verdun", "1"]).unwrap();

        let accounts = state.accounts();
        let acc = accounts.get("pia").unwrap();
        assert_eq!(acc.full_name, "Pia Haddad");
        assert_eq!(acc.area, "Verdun");
        assert!(acc.is_driver);
    }

    #[test]
    fn set_availability_requires_driver_role() {
        let (state, _dir) = test_broker();
        add_passenger(&state, "pia");
        assert_eq!(
            set_availability(&state, &["pia", "monday", "8", "0", "17", "0", "0"]).unwrap_err(),
            BrokerError::NotDriver
        );
    }

    // ── Broadcast ───────────────────────────────────────────────────────────
    #[test]
    fn broadcast_reaches_every_match_and_nobody_else() {
        let (state, _dir) = test_broker();
        add_driver(&state, "d1", "Hamra", "monday", "08:00", "17:00");
        add_driver(&state, "d2", "Hamra", "monday", "08:00", "09:00");
        add_driver(&state, "d3", "Verdun", "monday", "08:00", "17:00");
        add_passenger(&state, "pia");

        let resp = request_ride(&state, &["pia", "Hamra", "monday", "8", "0", "0"]).unwrap();
        assert_eq!(resp, "Request added to 2 driver(s).");

        let ids1 = pending_ids(&state, "d1");
        let ids2 = pending_ids(&state, "d2");
        assert_eq!(ids1.len(), 1);
        assert_eq!(ids1, ids2, "both queues hold the same id");
        assert!(pending_ids(&state, "d3").is_empty());
    }

    #[test]
    fn no_matching_driver_is_a_result_not_an_error() {
        let (state, _dir) = test_broker();
        add_passenger(&state, "pia");
        let resp = request_ride(&state, &["pia", "Hamra", "monday", "8", "0", "0"]).unwrap();
        assert_eq!(resp, "No valid drivers found.");
    }

    #[test]
    fn request_ride_rejects_unknown_day_and_bad_time() {
        let (state, _dir) = test_broker();
        add_passenger(&state, "pia");
        assert_eq!(
            request_ride(&state, &["pia", "Hamra", "someday", "8", "0", "0"]).unwrap_err(),
            BrokerError::InvalidDay
        );
        assert!(request_ride(&state, &["pia", "Hamra", "monday", "25", "0", "0"]).is_err());
        assert!(request_ride(&state, &["pia", "Hamra", "monday", "8", "0", "lots"]).is_err());
    }

    #[test]
    fn get_pending_is_idempotent_and_role_gated() {
        let (state, _dir) = test_broker();
        add_driver(&state, "d1", "Hamra", "monday", "08:00", "17:00");
        add_passenger(&state, "pia");
        request_ride(&state, &["pia", "Hamra", "monday", "8", "0", "0"]).unwrap();

        let first = get_pending(&state, &["d1"]).unwrap();
        let second = get_pending(&state, &["d1"]).unwrap();
        assert_eq!(first, second, "no mutation between reads");

        assert_eq!(
            get_pending(&state, &["pia"]).unwrap_err(),
            BrokerError::NotDriver
        );
    }

    // ── Accept race ─────────────────────────────────────────────────────────
    #[test]
    fn concurrent_accepts_yield_exactly_one_winner() {
        let (state, _dir) = test_broker();
        const DRIVERS: usize = 8;
        let names: Vec<String> = (0..DRIVERS).map(|i| format!("d{i}")).collect();
        for name in &names {
            add_driver(&state, name, "Hamra", "monday", "08:00", "17:00");
        }
        add_passenger(&state, "pia");
        request_ride(&state, &["pia", "Hamra", "monday", "8", "0", "0"]).unwrap();
        let id = pending_ids(&state, "d0").remove(0);

        let barrier = Arc::new(Barrier::new(DRIVERS));
        let mut handles = Vec::new();
        for name in names.clone() {
            let state = state.clone();
            let barrier = barrier.clone();
            let id = id.clone();
            handles.push(std::thread::spawn(move || {
                barrier.wait();
                accept_request(&state, &[&name, &id]).unwrap()
            }));
        }
        let outcomes: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let wins = outcomes.iter().filter(|r| *r == "Request accepted.").count();
        let losses = outcomes.iter().filter(|r| *r == "Request not found.").count();
        assert_eq!(wins, 1, "exactly one winner");
        assert_eq!(losses, DRIVERS - 1);

        // exactly one queue still holds the id, and it is active
        let accounts = state.accounts();
        let holders: Vec<&String> = names
            .iter()
            .filter(|n| accounts[n.as_str()].pending_requests.iter().any(|r| r.id == id))
            .collect();
        assert_eq!(holders.len(), 1);
        let winner = &accounts[holders[0].as_str()];
        assert_eq!(
            winner.pending_requests[0].status,
            crate::models::RequestStatus::Active
        );
        assert_eq!(
            winner.pending_requests[0].accepted_by.as_deref(),
            Some(holders[0].as_str())
        );
        // and the passenger sees exactly one active ride for it
        let pia = &accounts["pia"];
        assert_eq!(pia.active_rides.iter().filter(|r| r.id == id).count(), 1);
    }

    // ── Lifecycle end-to-end (the Hamra scenario) ───────────────────────────
    #[test]
    fn hamra_scenario_runs_end_to_end() {
        let (state, _dir) = test_broker();
        add_driver(&state, "D1", "Hamra", "mon", "08:00", "09:00");
        add_driver(&state, "D2", "Hamra", "mon", "08:00", "08:00");
        add_passenger(&state, "P");

        let resp = request_ride(&state, &["P", "Hamra", "mon", "8", "0", "0"]).unwrap();
        assert_eq!(resp, "Request added to 2 driver(s).");
        let x = pending_ids(&state, "D1").remove(0);
        assert_eq!(pending_ids(&state, "D2"), [x.clone()]);

        assert_eq!(
            accept_request(&state, &["D2", &x]).unwrap(),
            "Request accepted."
        );
        assert!(pending_ids(&state, "D1").is_empty(), "D1 lost the race");
        let active = get_active_rides(&state, &["P"]).unwrap();
        let rides: Vec<Value> = serde_json::from_str(active.strip_prefix("success:").unwrap()).unwrap();
        assert_eq!(rides.len(), 1);
        assert_eq!(rides[0]["id"], x.as_str());
        assert_eq!(rides[0]["driver"], "D2");

        assert_eq!(
            accept_request(&state, &["D1", &x]).unwrap(),
            "Request not found."
        );
    }

    #[test]
    fn complete_moves_ride_then_second_complete_fails() {
        let (state, _dir) = test_broker();
        add_driver(&state, "d1", "Hamra", "monday", "08:00", "17:00");
        add_passenger(&state, "pia");
        request_ride(&state, &["pia", "Hamra", "monday", "8", "0", "0"]).unwrap();
        let id = pending_ids(&state, "d1").remove(0);
        accept_request(&state, &["d1", &id]).unwrap();

        assert_eq!(
            end_request(&state, &["d1", &id]).unwrap(),
            "Request completed."
        );
        assert!(pending_ids(&state, "d1").is_empty());

        let active = get_active_rides(&state, &["pia"]).unwrap();
        assert_eq!(active, "success:[]");
        let completed = get_completed_rides(&state, &["pia"]).unwrap();
        let rides: Vec<Value> =
            serde_json::from_str(completed.strip_prefix("success:").unwrap()).unwrap();
        assert_eq!(rides.len(), 1);
        assert_eq!(rides[0]["status"], "completed");
        assert_eq!(rides[0]["driver_name"], "d1");

        assert_eq!(
            end_request(&state, &["d1", &id]).unwrap(),
            "Request not found."
        );
    }

    #[test]
    fn delete_request_is_index_based() {
        let (state, _dir) = test_broker();
        add_driver(&state, "d1", "Hamra", "monday", "08:00", "17:00");
        add_passenger(&state, "pia");
        request_ride(&state, &["pia", "Hamra", "monday", "8", "0", "0"]).unwrap();

        assert_eq!(
            delete_request(&state, &["d1", "3"]).unwrap(),
            "Invalid request index."
        );
        assert_eq!(
            delete_request(&state, &["d1", "not-a-number"]).unwrap(),
            "Invalid request index."
        );
        assert_eq!(delete_request(&state, &["d1", "0"]).unwrap(), "Request removed.");
        assert!(pending_ids(&state, "d1").is_empty());
    }

    #[test]
    fn delete_request_refuses_an_accepted_entry() {
        let (state, _dir) = test_broker();
        add_driver(&state, "d1", "Hamra", "monday", "08:00", "17:00");
        add_passenger(&state, "pia");
        request_ride(&state, &["pia", "Hamra", "monday", "8", "0", "0"]).unwrap();
        let id = pending_ids(&state, "d1").remove(0);
        accept_request(&state, &["d1", &id]).unwrap();

        assert_eq!(
            delete_request(&state, &["d1", "0"]).unwrap(),
            "Invalid request index."
        );
        assert_eq!(pending_ids(&state, "d1"), [id.clone()], "won entry survives");
        assert_eq!(end_request(&state, &["d1", &id]).unwrap(), "Request completed.");
    }

    // ── Ratings ─────────────────────────────────────────────────────────────
    #[test]
    fn rating_the_driver_retires_the_completed_ride() {
        let (state, _dir) = test_broker();
        add_driver(&state, "d1", "Hamra", "monday", "08:00", "17:00");
        add_passenger(&state, "pia");
        request_ride(&state, &["pia", "Hamra", "monday", "8", "0", "0"]).unwrap();
        let id = pending_ids(&state, "d1").remove(0);
        accept_request(&state, &["d1", &id]).unwrap();
        end_request(&state, &["d1", &id]).unwrap();

        let resp = rate_driver_ride(&state, &["pia", "d1", &id, "4"]).unwrap();
        assert_eq!(resp, "Driver rated successfully. New average: 4");
        assert_eq!(
            get_completed_rides(&state, &["pia"]).unwrap(),
            "success:[]",
            "the rating retires the record"
        );
    }

    #[test]
    fn rating_the_passenger_retires_nothing() {
        let (state, _dir) = test_broker();
        add_driver(&state, "d1", "Hamra", "monday", "08:00", "17:00");
        add_passenger(&state, "pia");
        request_ride(&state, &["pia", "Hamra", "monday", "8", "0", "0"]).unwrap();
        let id = pending_ids(&state, "d1").remove(0);
        accept_request(&state, &["d1", &id]).unwrap();
        end_request(&state, &["d1", &id]).unwrap();

        rate_passenger(&state, &["pia", "3.5"]).unwrap();
        let completed = get_completed_rides(&state, &["pia"]).unwrap();
        assert_ne!(completed, "success:[]", "asymmetry preserved");
    }

    #[test]
    fn ratings_are_clamped_and_bounded() {
        let (state, _dir) = test_broker();
        add_passenger(&state, "pia");
        assert_eq!(
            rate_passenger(&state, &["pia", "12"]).unwrap(),
            "Passenger rated successfully. New average: 5"
        );
        assert_eq!(
            rate_passenger(&state, &["pia", "-7"]).unwrap(),
            "Passenger rated successfully. New average: 2.5"
        );
        assert!(rate_passenger(&state, &["pia", "NaN"]).is_err());
        assert_eq!(
            rate_passenger(&state, &["ghost", "4"]).unwrap_err(),
            BrokerError::UnknownAccount
        );
    }

    // ── Chat ────────────────────────────────────────────────────────────────
    fn b64(text: &str) -> String {
        BASE64.encode(text.as_bytes())
    }

    #[test]
    fn messages_round_trip_in_insertion_order() {
        let (state, _dir) = test_broker();
        add_passenger(&state, "pia");
        add_driver(&state, "d1", "Hamra", "monday", "08:00", "17:00");

        assert_eq!(
            send_message(&state, &["ride-1", "pia", "d1", &b64("wait for me: 5 mins")]).unwrap(),
            "Message sent."
        );
        send_message(&state, &["ride-1", "d1", "pia", &b64("ok")]).unwrap();

        let resp = get_messages(&state, &["ride-1"]).unwrap();
        let msgs: Vec<Value> =
            serde_json::from_str(resp.strip_prefix("success:").unwrap()).unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0]["message"], "wait for me: 5 mins");
        assert_eq!(msgs[0]["seq"], 0);
        assert_eq!(msgs[1]["seq"], 1);
    }

    #[test]
    fn sender_rename_shows_up_in_old_messages() {
        let (state, _dir) = test_broker();
        add_passenger(&state, "pia");
        send_message(&state, &["ride-1", "pia", "d1", &b64("hello")]).unwrap();

        edit_profile(&state, &["pia", "Pia Haddad", "Hamra", "0"]).unwrap();

        let resp = get_messages(&state, &["ride-1"]).unwrap();
        let msgs: Vec<Value> =
            serde_json::from_str(resp.strip_prefix("success:").unwrap()).unwrap();
        assert_eq!(msgs[0]["sender_name"], "Pia Haddad", "resolved at read time");
    }

    #[test]
    fn send_message_validates_payload() {
        let (state, _dir) = test_broker();
        assert!(send_message(&state, &["", "pia", "d1", &b64("x")]).is_err());
        assert!(send_message(&state, &["ride-1", "", "d1", &b64("x")]).is_err());
        assert!(send_message(&state, &["ride-1", "pia", "", &b64("x")]).is_err());
        assert!(send_message(&state, &["ride-1", "pia", "d1", "not-base64!!"]).is_err());
        assert!(send_message(&state, &["ride-1", "pia", "d1"]).is_err());
    }

    #[test]
    fn messages_for_unknown_ride_are_empty() {
        let (state, _dir) = test_broker();
        assert_eq!(get_messages(&state, &["no-such-ride"]).unwrap(), "success:[]");
    }
}
