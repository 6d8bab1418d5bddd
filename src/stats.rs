//! Periodic JSON stats dump (§4.10's `stats dump` timer, §10), grounded on
//! the same compiled-in-and-spawned timer-task pattern the session crate's
//! own `TimerWheel` uses.

use std::path::PathBuf;

use serde::Serialize;

use session::Session;

#[derive(Serialize)]
struct StatsDocument {
    bytes_sent: u64,
    bytes_recvd: u64,
    send_loss_count: u32,
    average_rtt: f64,
    congestion_window: usize,
    shitty_internet_mode: bool,
}

impl From<session::Stats> for StatsDocument {
    fn from(s: session::Stats) -> Self {
        Self {
            bytes_sent: s.bytes_sent,
            bytes_recvd: s.bytes_recvd,
            send_loss_count: s.send_loss_count,
            average_rtt: s.average_rtt,
            congestion_window: s.congestion_window,
            shitty_internet_mode: s.shitty_internet_mode,
        }
    }
}

/// Spawns a task that writes `GetStats()` as JSON to `path` once per
/// second, matching libtgvoip's own stats-dump timer task (§4.10).
pub fn spawn_stats_dump(session: Session, path: PathBuf) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));
        loop {
            interval.tick().await;
            let doc = StatsDocument::from(session.get_stats());
            match serde_json::to_string_pretty(&doc) {
                Ok(json) => {
                    if let Err(e) = tokio::fs::write(&path, json).await {
                        log::warn!("stats dump write failed: {e}");
                    }
                }
                Err(e) => log::warn!("stats dump serialization failed: {e}"),
            }
        }
    })
}
