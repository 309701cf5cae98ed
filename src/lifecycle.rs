//! The broadcast / accept / complete / withdraw state machine.
//!
//! Every function here takes `&mut HashMap<String, Account>` — the caller is
//! expected to hold the single broker lock for the whole call, so each
//! multi-account read-modify-write below is one indivisible unit. That is
//! what resolves the accept race: accepts on the same request id are
//! linearized by the lock, the first one strips the id from every other
//! driver's queue, and any later accept simply no longer finds the entry.

use crate::error::BrokerError;
use crate::matcher;
use crate::models::{
    Account, RequestStatus, Ride, RideRequest, RideStatus, TimeOfDay, Weekday,
};
use std::collections::HashMap;
use uuid::Uuid;

/// Result of fanning a request out to matched drivers. Individual insertion
/// failures do not abort the broadcast; they are counted and reported back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastOutcome {
    pub request_id: String,
    pub inserted: usize,
    pub failed: usize,
}

/// Create a fresh request and copy it, pending, into every matched driver's
/// queue. The id is generated once; every copy carries it verbatim. An empty
/// match is a valid outcome (`inserted == 0`), not an error.
pub fn broadcast_request(
    accounts: &mut HashMap<String, Account>,
    passenger: &str,
    area: &str,
    day: Weekday,
    time: TimeOfDay,
    min_rating: f64,
) -> Result<BroadcastOutcome, BrokerError> {
    if !accounts.contains_key(passenger) {
        return Err(BrokerError::UnknownAccount);
    }

    let matched = matcher::eligible_drivers(accounts, area, day, time, min_rating);
    let request = RideRequest {
        id: Uuid::new_v4().to_string(),
        passenger: passenger.to_string(),
        area: area.to_string(),
        day,
        time,
        min_driver_rating: min_rating,
        status: RequestStatus::Pending,
        accepted_by: None,
    };

    let mut inserted = 0;
    let mut failed = 0;
    for driver in &matched {
        // Best-effort fan-out: a missing driver record is logged and counted,
        // the remaining queues still get their copy.
        match accounts.get_mut(driver) {
            Some(acc) => {
                acc.pending_requests.push(request.clone());
                inserted += 1;
            }
            None => {
                tracing::warn!(driver, request_id = %request.id, "fan-out target vanished");
                failed += 1;
            }
        }
    }

    tracing::info!(
        request_id = %request.id,
        passenger,
        area,
        day = %day,
        inserted,
        failed,
        "request broadcast"
    );
    Ok(BroadcastOutcome {
        request_id: request.id,
        inserted,
        failed,
    })
}

/// Snapshot of a driver's queue. Read-only; two calls with no intervening
/// mutation return identical results.
pub fn pending_for(
    accounts: &HashMap<String, Account>,
    driver: &str,
) -> Result<Vec<RideRequest>, BrokerError> {
    let acc = accounts.get(driver).ok_or(BrokerError::UnknownAccount)?;
    if !acc.is_driver {
        return Err(BrokerError::NotDriver);
    }
    Ok(acc.pending_requests.clone())
}

/// Claim a request. One indivisible unit under the broker lock:
///   1. find the id in this driver's queue (absent → `UnknownRequest`)
///   2. mark it active, record the winner
///   3. strip the id from every other driver's queue
///   4. upsert the passenger's active Ride keyed by the id
///
/// Exactly one concurrent accept can reach step 2 for a given id; the rest
/// fail step 1.
pub fn accept(
    accounts: &mut HashMap<String, Account>,
    driver: &str,
    request_id: &str,
) -> Result<(), BrokerError> {
    let acc = accounts.get_mut(driver).ok_or(BrokerError::UnknownRequest)?;
    let entry = acc
        .pending_requests
        .iter_mut()
        .find(|r| r.id == request_id)
        .ok_or(BrokerError::UnknownRequest)?;

    entry.status = RequestStatus::Active;
    entry.accepted_by = Some(driver.to_string());
    let won = entry.clone();

    // The other drivers lost the race: their copies disappear.
    for (name, other) in accounts.iter_mut() {
        if name.as_str() != driver {
            other.pending_requests.retain(|r| r.id != request_id);
        }
    }

    let ride = Ride {
        id: won.id.clone(),
        driver: driver.to_string(),
        passenger: won.passenger.clone(),
        area: won.area.clone(),
        day: won.day,
        time: won.time,
        status: RideStatus::Active,
    };
    match accounts.get_mut(&won.passenger) {
        Some(pass) => {
            // keyed by id: replace any stale projection rather than duplicate
            pass.active_rides.retain(|r| r.id != request_id);
            pass.active_rides.push(ride);
        }
        None => {
            tracing::warn!(passenger = %won.passenger, request_id, "accept for unknown passenger");
        }
    }

    tracing::info!(driver, request_id, "request accepted");
    Ok(())
}

/// Finish a ride. Removes the entry from the driver's queue and moves the
/// passenger's projection from active to completed. Only an ACTIVE entry
/// qualifies: a still-pending copy has not been won by this driver, and
/// completing it would leave live copies of a finished id in every other
/// queue.
pub fn complete(
    accounts: &mut HashMap<String, Account>,
    driver: &str,
    request_id: &str,
) -> Result<(), BrokerError> {
    let acc = accounts.get_mut(driver).ok_or(BrokerError::UnknownRequest)?;
    let pos = acc
        .pending_requests
        .iter()
        .position(|r| r.id == request_id && r.status == RequestStatus::Active)
        .ok_or(BrokerError::UnknownRequest)?;
    let done = acc.pending_requests.remove(pos);

    if let Some(pass) = accounts.get_mut(&done.passenger) {
        pass.active_rides.retain(|r| r.id != request_id);
        pass.completed_rides.push(Ride {
            id: done.id.clone(),
            driver: driver.to_string(),
            passenger: done.passenger.clone(),
            area: done.area.clone(),
            day: done.day,
            time: done.time,
            status: RideStatus::Completed,
        });
    }

    tracing::info!(driver, request_id, "request completed");
    Ok(())
}

/// Legacy positional removal, used by the dashboard's "Remove" action before
/// acceptance. An accepted (active) entry is the only queue copy of a live
/// ride, so it cannot be withdrawn — that ride ends through `complete`.
pub fn withdraw(
    accounts: &mut HashMap<String, Account>,
    driver: &str,
    index: usize,
) -> Result<RideRequest, BrokerError> {
    let acc = accounts.get_mut(driver).ok_or(BrokerError::UnknownAccount)?;
    match acc.pending_requests.get(index) {
        Some(r) if r.status == RequestStatus::Pending => {}
        _ => return Err(BrokerError::InvalidIndex),
    }
    let removed = acc.pending_requests.remove(index);
    tracing::info!(driver, request_id = %removed.id, "request withdrawn");
    Ok(removed)
}

pub fn active_rides(
    accounts: &HashMap<String, Account>,
    passenger: &str,
) -> Result<Vec<Ride>, BrokerError> {
    let acc = accounts.get(passenger).ok_or(BrokerError::UnknownAccount)?;
    Ok(acc.active_rides.clone())
}

pub fn completed_rides(
    accounts: &HashMap<String, Account>,
    passenger: &str,
) -> Result<Vec<Ride>, BrokerError> {
    let acc = accounts.get(passenger).ok_or(BrokerError::UnknownAccount)?;
    Ok(acc.completed_rides.clone())
}

/// Rate the driver for one finished ride, then retire that ride from the
/// rating passenger's completed list — the rating is the acknowledgment that
/// closes out the record. Note the asymmetry: `rate_passenger` below retires
/// nothing. That matches the legacy system as observed.
pub fn rate_driver_for_ride(
    accounts: &mut HashMap<String, Account>,
    passenger: &str,
    driver: &str,
    request_id: &str,
    rating: f64,
) -> Result<f64, BrokerError> {
    let drv = accounts.get_mut(driver).ok_or(BrokerError::UnknownAccount)?;
    if !drv.is_driver {
        return Err(BrokerError::NotDriver);
    }
    let average = crate::rating::apply(&mut drv.driver_rating, rating);

    if let Some(pass) = accounts.get_mut(passenger) {
        pass.completed_rides.retain(|r| r.id != request_id);
    }

    tracing::info!(passenger, driver, request_id, average, "driver rated");
    Ok(average)
}

pub fn rate_passenger(
    accounts: &mut HashMap<String, Account>,
    passenger: &str,
    rating: f64,
) -> Result<f64, BrokerError> {
    let pass = accounts.get_mut(passenger).ok_or(BrokerError::UnknownAccount)?;
    let average = crate::rating::apply(&mut pass.passenger_rating, rating);
    tracing::info!(passenger, average, "passenger rated");
    Ok(average)
}
