use crate::models::{Account, ChatMessage};
use anyhow::Context;
use chrono::Utc;
use crossbeam_channel::{bounded, Sender as CbSender};
use dashmap::DashMap;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

const ACCOUNTS_FILE: &str = "accounts.json";
const MESSAGES_FILE: &str = "messages.jsonl";
const PERSIST_QUEUE_DEPTH: usize = 100_000;
const PERSIST_BATCH_LIMIT: usize = 4096;

// ── Persistence Pipeline ─────────────────────────────────────────────────────
// Operations dispatched from the hot path to the background persistence
// worker. Mutations return to the client after the in-memory change plus a
// channel send; disk I/O never happens under the broker lock.
#[derive(Debug)]
pub enum PersistOp {
    /// Full serialized account table. Snapshots within one batch are
    /// coalesced — only the newest is written.
    SnapshotAccounts(String),
    /// One serialized `ChatMessage`, appended to the message log.
    AppendMessage(String),
}

// ── Core State ───────────────────────────────────────────────────────────────
// The account table (with its embedded driver queues and ride projections)
// sits behind ONE mutex: every lifecycle transition is a single lock
// acquisition covering the whole multi-account read-modify-write. The chat
// log is append-only per ride and not part of any lifecycle transition, so
// it lives in a DashMap and never touches the broker lock.
#[derive(Clone)]
pub struct Brokerage {
    accounts: Arc<Mutex<HashMap<String, Account>>>,
    chats: Arc<DashMap<String, Vec<ChatMessage>>>,

    persist_tx: CbSender<PersistOp>,

    // Stored so shutdown() can join the worker and wait for pending batches
    // to reach disk.
    persist_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Brokerage {
    pub fn new(data_dir: &Path) -> anyhow::Result<Self> {
        fs::create_dir_all(data_dir).context("Failed to create data directory")?;

        // ── 1. Load persisted state ──────────────────────────────────────────
        let accounts_path = data_dir.join(ACCOUNTS_FILE);
        let accounts: HashMap<String, Account> = if accounts_path.exists() {
            let raw = fs::read_to_string(&accounts_path)
                .context("Failed to read account table")?;
            serde_json::from_str(&raw).context("Failed to parse account table")?
        } else {
            HashMap::new()
        };

        let chats: DashMap<String, Vec<ChatMessage>> = DashMap::new();
        let messages_path = data_dir.join(MESSAGES_FILE);
        if messages_path.exists() {
            let raw = fs::read_to_string(&messages_path)
                .context("Failed to read message log")?;
            for line in raw.lines().filter(|l| !l.trim().is_empty()) {
                match serde_json::from_str::<ChatMessage>(line) {
                    Ok(msg) => chats.entry(msg.ride_id.clone()).or_default().push(msg),
                    Err(e) => tracing::warn!("Skipping corrupt message log line: {}", e),
                }
            }
        }

        tracing::info!(
            accounts = accounts.len(),
            rides_with_chat = chats.len(),
            "Brokerage state loaded"
        );

        // ── 2. Persistence Worker (dedicated OS thread) ──────────────────────
        // Owns the data files exclusively. Batches operations: block on the
        // first op, drain whatever else is pending, write once.
        let (persist_tx, persist_rx) = bounded::<PersistOp>(PERSIST_QUEUE_DEPTH);
        let worker_dir = data_dir.to_path_buf();
        let persist_handle = std::thread::Builder::new()
            .name("persist-worker".into())
            .spawn(move || persistence_worker(persist_rx, worker_dir))
            .context("Failed to spawn persistence worker")?;

        Ok(Brokerage {
            accounts: Arc::new(Mutex::new(accounts)),
            chats: Arc::new(chats),
            persist_tx,
            persist_handle: Arc::new(Mutex::new(Some(persist_handle))),
        })
    }

    /// The broker lock. Hold the guard for the entire read-modify-write of a
    /// lifecycle transition. Poisoning is recovered — a panicked worker must
    /// not wedge every later connection.
    pub fn accounts(&self) -> MutexGuard<'_, HashMap<String, Account>> {
        self.accounts.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enqueue a full account-table snapshot. Called while still holding the
    /// broker lock so snapshots are enqueued in mutation order; the encode is
    /// CPU-only and the write happens on the worker thread.
    pub fn persist_accounts(&self, accounts: &HashMap<String, Account>) {
        match serde_json::to_string(accounts) {
            Ok(raw) => {
                if let Err(e) = self.persist_tx.try_send(PersistOp::SnapshotAccounts(raw)) {
                    tracing::warn!("Persist queue full, dropping account snapshot: {}", e);
                }
            }
            Err(e) => tracing::error!("Failed to encode account table: {}", e),
        }
    }

    /// Append one chat message: in-memory log plus the durable JSONL line.
    /// The per-ride entry lock makes the seq assignment atomic.
    pub fn append_chat(
        &self,
        ride_id: &str,
        sender: &str,
        recipient: &str,
        text: String,
    ) -> ChatMessage {
        let mut log = self.chats.entry(ride_id.to_string()).or_default();
        let msg = ChatMessage {
            ride_id: ride_id.to_string(),
            sender: sender.to_string(),
            recipient: recipient.to_string(),
            text,
            seq: log.len(),
            sent_at: Utc::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        };
        log.push(msg.clone());
        drop(log);

        match serde_json::to_string(&msg) {
            Ok(line) => {
                if let Err(e) = self.persist_tx.try_send(PersistOp::AppendMessage(line)) {
                    tracing::warn!("Persist queue full, dropping message append: {}", e);
                }
            }
            Err(e) => tracing::error!("Failed to encode chat message: {}", e),
        }
        msg
    }

    /// Chat log for one ride, in insertion order.
    pub fn chat_for(&self, ride_id: &str) -> Vec<ChatMessage> {
        self.chats
            .get(ride_id)
            .map(|log| log.value().clone())
            .unwrap_or_default()
    }

    /// Drop the sender and join the worker so pending batches reach disk
    /// before process exit. Callers must ensure this is the last live clone.
    pub fn shutdown(self) {
        drop(self.persist_tx);
        let mut guard = self
            .persist_handle
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = guard.take() {
            if let Err(e) = handle.join() {
                tracing::error!("Persistence worker panicked: {:?}", e);
            }
        }
    }
}

// ── Persistence Worker ───────────────────────────────────────────────────────
// Runs on a dedicated OS thread. Pattern: block on the first op, drain
// pending, coalesce snapshots (only the newest matters), append message
// lines, write once per batch. The snapshot goes through a temp file +
// rename so a crash mid-write never truncates the account table.
fn persistence_worker(rx: crossbeam_channel::Receiver<PersistOp>, data_dir: PathBuf) {
    tracing::info!("Persistence worker started");

    let accounts_path = data_dir.join(ACCOUNTS_FILE);
    let accounts_tmp = data_dir.join(format!("{ACCOUNTS_FILE}.tmp"));
    let messages_path = data_dir.join(MESSAGES_FILE);

    let mut batch: Vec<PersistOp> = Vec::with_capacity(PERSIST_BATCH_LIMIT);

    loop {
        let first = match rx.recv() {
            Ok(op) => op,
            Err(_) => {
                tracing::info!("Persistence worker shutting down (channel closed)");
                break;
            }
        };

        batch.clear();
        batch.push(first);
        while batch.len() < PERSIST_BATCH_LIMIT {
            match rx.try_recv() {
                Ok(op) => batch.push(op),
                Err(_) => break,
            }
        }

        let mut snapshot: Option<String> = None;
        let mut lines: Vec<String> = Vec::new();
        for op in batch.drain(..) {
            match op {
                PersistOp::SnapshotAccounts(raw) => snapshot = Some(raw),
                PersistOp::AppendMessage(line) => lines.push(line),
            }
        }

        if let Some(raw) = snapshot {
            let result = fs::write(&accounts_tmp, raw)
                .and_then(|()| fs::rename(&accounts_tmp, &accounts_path));
            if let Err(e) = result {
                tracing::error!("Account snapshot write failed: {}", e);
            }
        }

        if !lines.is_empty() {
            let appended = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&messages_path)
                .and_then(|mut f| {
                    for line in &lines {
                        writeln!(f, "{}", line)?;
                    }
                    Ok(())
                });
            if let Err(e) = appended {
                tracing::error!("Message log append failed ({} lines): {}", lines.len(), e);
            }
        }
    }
}
