// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Kahlo Contributors

//! `tracing` setup (§1): `EnvFilter` from `KAHLO_LOG`, falling back to
//! `RUST_LOG`, falling back to `info`. Logs append to `<dataDir>/kahlo.log`
//! via a daily-rolling, non-blocking writer; the guard must be held for the
//! process lifetime or buffered lines are lost on exit.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

fn filter() -> EnvFilter {
    if let Ok(directive) = std::env::var("KAHLO_LOG") {
        return EnvFilter::new(directive);
    }
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber. Returns the appender guard; drop it only
/// at process exit.
pub fn init(data_dir: &Path) -> WorkerGuard {
    let appender = tracing_appender::rolling::daily(data_dir, "kahlo.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::fmt()
        .with_env_filter(filter())
        .with_writer(writer)
        .with_ansi(false)
        .init();

    guard
}
