//! Completion accounting for the benchmark.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{info, warn};

use fkv_client::TransportResult;

/// Message code the store uses for a successful fetch reply.
const FETCH_REPLY_CODE: u8 = 10;

/// Final numbers printed when the run ends.
#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    pub expected: u32,
    pub completed: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub elapsed_secs: f64,
    pub messages_per_sec: f64,
}

struct Counts {
    completed: u32,
    failed: u32,
    last_log: Instant,
}

/// Thread-safe tally of completed requests.
pub struct Tally {
    expected: u32,
    log_every: u32,
    started: Instant,
    counts: Mutex<Counts>,
    done: Notify,
}

impl Tally {
    pub fn new(expected: u32) -> Self {
        let now = Instant::now();
        Tally {
            expected,
            log_every: (expected / 20).max(1),
            started: now,
            counts: Mutex::new(Counts {
                completed: 0,
                failed: 0,
                last_log: now,
            }),
            done: Notify::new(),
        }
    }

    pub fn log_every(&self) -> u32 {
        self.log_every
    }

    /// Records the outcome of request `index`.
    pub fn record(&self, index: u32, result: TransportResult<Bytes>) {
        let mut counts = self.counts.lock().expect("tally mutex poisoned");
        counts.completed += 1;
        match result {
            Err(err) => {
                counts.failed += 1;
                warn!(request = index, error = %err, "request failed");
            }
            Ok(reply) if reply.first() != Some(&FETCH_REPLY_CODE) => {
                warn!(len = reply.len(), code = ?reply.first(), "bad reply from store");
            }
            Ok(_) if counts.completed == 1 => {
                let secs = seconds_since(&mut counts.last_log);
                info!(secs, "first message");
            }
            Ok(_) if counts.completed % self.log_every == 0 || counts.completed == self.expected => {
                let per_sec = f64::from(self.log_every) / seconds_since(&mut counts.last_log);
                info!(sent = counts.completed, messages_per_sec = per_sec, "progress");
            }
            Ok(_) => {}
        }

        if counts.completed == self.expected {
            self.done.notify_one();
        }
    }

    /// Resolves once every expected request has completed.
    pub async fn finished(&self) {
        if self.expected == 0 {
            return;
        }
        self.done.notified().await;
    }

    pub fn summary(&self) -> Summary {
        let counts = self.counts.lock().expect("tally mutex poisoned");
        let elapsed = self.started.elapsed();
        Summary {
            expected: self.expected,
            completed: counts.completed,
            succeeded: counts.completed - counts.failed,
            failed: counts.failed,
            elapsed_secs: elapsed.as_secs_f64(),
            messages_per_sec: rate(counts.completed, elapsed),
        }
    }
}

fn seconds_since(last: &mut Instant) -> f64 {
    let now = Instant::now();
    let secs = now.duration_since(*last).as_secs_f64().max(1e-3);
    *last = now;
    secs
}

fn rate(count: u32, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        f64::from(count) / secs
    } else {
        0.0
    }
}
