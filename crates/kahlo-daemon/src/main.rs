// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Kahlo Contributors

//! `kahlod`: process wiring, configuration loading, logging setup, and the
//! long-running host (§0, §5 "SUPPLEMENTED FEATURES").

mod cli;
mod config;
mod logging;

use std::io::{BufRead, Write};
use std::sync::Arc;

use clap::Parser;
use kahlo_adapters::fake::FakeDeviceBridge;
use kahlo_adapters::DeviceBridge;
use kahlo_core::SystemClock;
use kahlo_engine::{JobController, TargetManager};
use kahlo_facade::Facade;
use kahlo_storage::{ArtifactStore, DataPaths, DraftStore, EventPipeline, EventPipelineLimits, ModuleStore};

use cli::{Cli, Command, ConfigCommand};
use config::Config;

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = Cli::parse();
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("kahlod: failed to load configuration: {e}");
            return std::process::ExitCode::FAILURE;
        }
    };

    match cli.command {
        Command::Config { command: ConfigCommand::Show } => {
            print_config(&config);
            std::process::ExitCode::SUCCESS
        }
        Command::Serve => {
            if let Err(e) = std::fs::create_dir_all(&config.data_dir) {
                eprintln!("kahlod: failed to create data directory: {e}");
                return std::process::ExitCode::FAILURE;
            }
            let _log_guard = logging::init(&config.data_dir);
            tracing::info!(data_dir = %config.data_dir.display(), "kahlod starting");
            serve(config).await;
            std::process::ExitCode::SUCCESS
        }
    }
}

fn print_config(config: &Config) {
    let json = serde_json::json!({
        "data_dir": config::path_display(&config.data_dir),
        "limits": {
            "target_artifact_budget_bytes": config.limits.target_artifact_budget_bytes,
            "artifact_inline_threshold_bytes": config.limits.artifact_inline_threshold_bytes,
            "target_stream_capacity": config.limits.target_stream_capacity,
            "job_stream_capacity": config.limits.job_stream_capacity,
            "event_fetch_default_limit": config.limits.event_fetch_default_limit,
            "event_fetch_max_limit": config.limits.event_fetch_max_limit,
            "job_retention_secs": config.limits.job_retention_secs,
        },
        "timeouts": {
            "ping_ms": config.timeouts.ping_ms,
            "device_resolve_ms": config.timeouts.device_resolve_ms,
            "attach_ms": config.timeouts.attach_ms,
            "spawn_ms": config.timeouts.spawn_ms,
            "snapshot_ms": config.timeouts.snapshot_ms,
        },
        "reload": { "watch": config.reload_watch },
        "runtime": { "bundle_path": config.runtime_bundle_path.as_deref().map(config::path_display) },
    });
    println!("{}", serde_json::to_string_pretty(&json).unwrap_or_default());
}

/// Wire every store/engine singleton behind one [`Facade`], then read
/// stdin-framed `{"tool": ..., "params": ...}` requests one per line,
/// writing each `{ok, ...}` envelope back to stdout on its own line.
async fn serve(config: Config) {
    let paths = DataPaths::new(config.data_dir.clone());
    let clock = SystemClock;
    let device: Arc<dyn DeviceBridge> = Arc::new(FakeDeviceBridge::new());

    let event_pipeline = Arc::new(EventPipeline::with_limits(
        paths.clone(),
        EventPipelineLimits {
            target_stream_capacity: config.limits.target_stream_capacity,
            job_stream_capacity: config.limits.job_stream_capacity,
            event_fetch_default_limit: config.limits.event_fetch_default_limit,
            event_fetch_max_limit: config.limits.event_fetch_max_limit,
        },
    ));
    let artifact_store = Arc::new(ArtifactStore::with_inline_threshold(
        paths.clone(),
        config.limits.target_artifact_budget_bytes,
        config.limits.artifact_inline_threshold_bytes,
    ));
    let draft_store = Arc::new(DraftStore::new(paths.clone()));
    let module_store = Arc::new(ModuleStore::new(paths));

    let target_manager =
        TargetManager::new(device.clone(), clock.clone(), event_pipeline.clone(), artifact_store.clone(), draft_store.clone(), module_store.clone());
    let job_controller = JobController::new(
        target_manager.clone(),
        clock.clone(),
        std::time::Duration::from_secs(config.limits.job_retention_secs),
        config.runtime_bundle_path.clone(),
    );
    target_manager.set_job_coordinator(job_controller.clone());

    let facade =
        Facade::new(device, target_manager, job_controller, event_pipeline, artifact_store, draft_store, module_store, clock);

    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "stdin read error, stopping serve loop");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let response = handle_line(&facade, &line).await;
        let mut out = stdout.lock();
        let _ = writeln!(out, "{response}");
    }
}

async fn handle_line(facade: &Facade<SystemClock>, line: &str) -> String {
    #[derive(serde::Deserialize)]
    struct Envelope {
        tool: String,
        #[serde(default)]
        params: serde_json::Value,
    }

    let parsed: Result<Envelope, _> = serde_json::from_str(line);
    let response = match parsed {
        Ok(req) => facade.dispatch(&req.tool, req.params).await,
        Err(e) => serde_json::json!({
            "ok": false,
            "error": {
                "code": "INVALID_ARGUMENT",
                "message": format!("malformed request line: {e}"),
                "tool": "",
                "retryable": false,
                "suggestion": "send {\"tool\": \"...\", \"params\": {...}} one per line",
            }
        }),
    };
    serde_json::to_string(&response).unwrap_or_else(|_| r#"{"ok":false}"#.to_string())
}
