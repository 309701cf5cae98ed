//! Connection handling and command routing.
//!
//! The protocol is one colon-separated command line per connection: read the
//! line, route it, write one response, close. Routing goes through a
//! registered-handler map keyed by the (case-insensitive) command name; each
//! handler validates its own argument arity and types.

use crate::controllers;
use crate::error::BrokerError;
use crate::state::Brokerage;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const MAX_COMMAND_BYTES: usize = 128 * 1024;

pub type Handler = fn(&Brokerage, &[&str]) -> Result<String, BrokerError>;

pub struct Registry {
    handlers: HashMap<&'static str, Handler>,
}

impl Registry {
    pub fn new() -> Self {
        let mut handlers: HashMap<&'static str, Handler> = HashMap::new();
        handlers.insert("register", controllers::register);
        handlers.insert("login", controllers::login);
        handlers.insert("editprofile", controllers::edit_profile);
        handlers.insert("set_availability", controllers::set_availability);
        handlers.insert("request_ride", controllers::request_ride);
        handlers.insert("get_pending", controllers::get_pending);
        handlers.insert("accept_request", controllers::accept_request);
        handlers.insert("end_request", controllers::end_request);
        handlers.insert("delete_request", controllers::delete_request);
        handlers.insert("get_active_rides", controllers::get_active_rides);
        handlers.insert("get_completed_rides", controllers::get_completed_rides);
        handlers.insert("rate_driver_ride", controllers::rate_driver_ride);
        handlers.insert("rate_passenger", controllers::rate_passenger);
        handlers.insert("send_message", controllers::send_message);
        handlers.insert("get_messages", controllers::get_messages);
        Registry { handlers }
    }

    /// Route one raw command line to its handler and produce the wire
    /// response. Failures become `error:<message>`; a handler can never
    /// take down the worker.
    pub fn dispatch(&self, state: &Brokerage, line: &str) -> String {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return "error:Empty command.".to_string();
        }
        let mut fields = trimmed.split(':');
        let command = fields.next().unwrap_or_default().to_lowercase();
        let args: Vec<&str> = fields.collect();

        match self.handlers.get(command.as_str()) {
            Some(handler) => match handler(state, &args) {
                Ok(resp) => resp,
                Err(e) => {
                    tracing::debug!(command = %command, error = %e, "command failed");
                    format!("error:{e}")
                }
            },
            None => "Invalid command.".to_string(),
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// One worker per connection: read the command, respond, close. Legacy
/// clients send the line in one burst and do not always terminate it with a
/// newline, so we stop at a newline, at end-of-stream, or once the socket
/// has nothing more buffered.
pub async fn handle_connection(mut stream: TcpStream, state: Brokerage, registry: Arc<Registry>) {
    let mut buf: Vec<u8> = Vec::with_capacity(1024);
    let mut chunk = [0u8; 2048];

    loop {
        match stream.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                if buf.contains(&b'\n') || buf.len() >= MAX_COMMAND_BYTES {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!("connection read failed: {}", e);
                return;
            }
        }
        // Drain whatever else has already arrived, then treat the command
        // as complete — mirrors the single-recv framing the clients expect.
        loop {
            match stream.try_read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    tracing::debug!("connection read failed: {}", e);
                    return;
                }
            }
        }
        break;
    }

    let line = String::from_utf8_lossy(&buf);
    let response = registry.dispatch(&state, &line);
    if let Err(e) = stream.write_all(response.as_bytes()).await {
        tracing::debug!("connection write failed: {}", e);
    }
    let _ = stream.shutdown().await;
}
