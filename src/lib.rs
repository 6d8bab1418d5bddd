//! ## `voip-core`: engine bootstrap
//!
//! This crate is the thin wiring layer, grounded on `turn_server::server_main`:
//! it owns the process config, the logging backend, and the stats-dump task,
//! and hands everything else to the `session` crate. A real embedding
//! application (mobile app, desktop client) links `session`/`transport`
//! directly and drives a `Session` itself; this binary exists to prove the
//! crates assemble into a running engine and as a reference for how the
//! pieces fit together.

pub mod config;
pub mod observer;
pub mod stats;

use std::sync::Arc;

use config::Config;
use observer::LoggingObserver;

/// Builds a `Session` from process configuration, wired with the default
/// logging observer, matching the `Observer::new(config, monitor)`
/// construction in `turn_server::server_main`.
pub fn build_session(config: &Config) -> session::Session {
    let session_config = config.engine.to_session_config();
    session::Session::with_observer(session_config, Arc::new(LoggingObserver))
}

/// Runs the engine to completion: starts the session's timer/state
/// machinery, optionally spawns the stats-dump task, and attaches a UDP
/// transport bound on an ephemeral port. Mirrors `turn_server::server_main`'s
/// role as the single entry point `main.rs` calls into.
pub async fn run(config: Arc<Config>) -> anyhow::Result<()> {
    let session = build_session(&config);
    session.start();

    if let Some(path) = &config.engine.stats_dump_file_path {
        stats::spawn_stats_dump(session.clone(), path.into());
    }

    if !config.server_config.is_empty() {
        session.apply_server_config(&config.server_config);
    }

    let socket = transport::UdpSocket::bind(0).await?;
    log::info!("bound local endpoint: {:?}", socket.local_endpoint());
    session.connect(Arc::new(socket)).await?;

    Ok(())
}
