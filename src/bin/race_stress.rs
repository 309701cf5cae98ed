//! Accept-race load client. Registers a fleet of drivers covering the same
//! area and window, broadcasts one ride request to all of them, then fires
//! every accept concurrently and checks that exactly one wins.
//!
//! Run against a live server:  RIDEPOOL_ADDR=127.0.0.1:12345 cargo run --bin race_stress

use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Barrier;
use uuid::Uuid;

const DRIVERS: usize = 20;
const ROUNDS: usize = 10;

struct Metrics {
    accepts_won: AtomicU64,
    accepts_lost: AtomicU64,
    accepts_err: AtomicU64,
}

/// One command per connection, the way the legacy protocol works.
async fn send_command(addr: &str, line: &str) -> anyhow::Result<String> {
    let mut conn = TcpStream::connect(addr).await?;
    conn.write_all(line.as_bytes()).await?;
    conn.write_all(b"\n").await?;
    let mut resp = String::new();
    conn.read_to_string(&mut resp).await?;
    Ok(resp)
}

async fn first_pending_id(addr: &str, driver: &str) -> anyhow::Result<String> {
    let resp = send_command(addr, &format!("get_pending:{driver}")).await?;
    let payload = resp
        .strip_prefix("success:")
        .ok_or_else(|| anyhow::anyhow!("unexpected get_pending response: {resp}"))?;
    let list: Vec<Value> = serde_json::from_str(payload)?;
    list.first()
        .and_then(|r| r["id"].as_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("driver {driver} has an empty queue"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let addr = std::env::var("RIDEPOOL_ADDR").unwrap_or_else(|_| "127.0.0.1:12345".to_string());
    println!("--- ridepool accept-race stress ---");
    println!("Target:  {addr}");
    println!("Drivers: {DRIVERS}");
    println!("Rounds:  {ROUNDS}\n");

    // Unique per run so reruns against a persistent server never collide.
    let run = Uuid::new_v4().simple().to_string();
    let area = format!("StressArea_{run}");
    let passenger = format!("stress_p_{run}");
    let drivers: Vec<String> = (0..DRIVERS).map(|i| format!("stress_d_{run}_{i}")).collect();

    // 1. Fleet setup
    let setup = Instant::now();
    send_command(
        &addr,
        &format!("register:{passenger}:Stress Passenger:s@x:pw:{area}:0"),
    )
    .await?;
    for driver in &drivers {
        send_command(&addr, &format!("register:{driver}:Stress Driver:s@x:pw:{area}:1")).await?;
        send_command(&addr, &format!("set_availability:{driver}:monday:8:0:17:0:0")).await?;
    }
    println!("fleet ready in {:.2?}", setup.elapsed());

    let metrics = Arc::new(Metrics {
        accepts_won: AtomicU64::new(0),
        accepts_lost: AtomicU64::new(0),
        accepts_err: AtomicU64::new(0),
    });

    // 2. Broadcast + race, repeated
    let mut clean_rounds = 0;
    for round in 0..ROUNDS {
        let resp = send_command(
            &addr,
            &format!("request_ride:{passenger}:{area}:monday:8:0:5"),
        )
        .await?;
        if !resp.starts_with("Request added to") {
            anyhow::bail!("broadcast failed in round {round}: {resp}");
        }
        let request_id = first_pending_id(&addr, &drivers[0]).await?;

        let barrier = Arc::new(Barrier::new(DRIVERS));
        let mut handles = Vec::new();
        for driver in drivers.clone() {
            let addr = addr.clone();
            let barrier = barrier.clone();
            let request_id = request_id.clone();
            let metrics = metrics.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                match send_command(&addr, &format!("accept_request:{driver}:{request_id}")).await {
                    Ok(resp) if resp == "Request accepted." => {
                        metrics.accepts_won.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(resp) if resp == "Request not found." => {
                        metrics.accepts_lost.fetch_add(1, Ordering::Relaxed);
                    }
                    _ => {
                        metrics.accepts_err.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }));
        }
        for h in handles {
            h.await?;
        }

        let won = metrics.accepts_won.swap(0, Ordering::Relaxed);
        let lost = metrics.accepts_lost.swap(0, Ordering::Relaxed);
        let errs = metrics.accepts_err.swap(0, Ordering::Relaxed);
        let clean = won == 1 && lost == (DRIVERS as u64 - 1) && errs == 0;
        if clean {
            clean_rounds += 1;
        }
        println!(
            "round {round:2}: won={won} lost={lost} err={errs}  {}",
            if clean { "ok" } else { "VIOLATION" }
        );

        // Drain the winner's queue so the next round starts clean.
        for driver in &drivers {
            let resp = send_command(&addr, &format!("end_request:{driver}:{request_id}")).await?;
            if resp == "Request completed." {
                break;
            }
        }
    }

    println!("\n{clean_rounds}/{ROUNDS} rounds upheld at-most-one-winner");
    if clean_rounds != ROUNDS {
        anyhow::bail!("accept race violated in {} round(s)", ROUNDS - clean_rounds);
    }
    Ok(())
}
