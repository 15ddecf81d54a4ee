// ODDM Toolkit host setup
// Main library entry point

pub mod config;
pub mod database;
pub mod models;
pub mod security;
pub mod setup;
pub mod tui;
pub mod utils;

use anyhow::{Context, Result};
use log::{error, info};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::config::SetupConfig;
use crate::database::connection::PgConnector;
use crate::models::marker::SetupMarker;
use crate::security::machine_id::MachineIdentity;
use crate::security::marker_store::EncryptedMarkerStore;
use crate::setup::gdrive::GoogleDriveProbe;
use crate::setup::orchestrator::SetupOrchestrator;
use crate::utils::path_resolver;

/// Initialize logging with dual format (JSON + human-readable). Returns the log directory.
pub fn init_logging(deployment_folder: &Path, with_stdout: bool) -> Result<PathBuf> {
    let log_dir = path_resolver::resolve_log_folder(deployment_folder)?;
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create log directory {:?}", log_dir))?;

    let timestamp = chrono::Utc::now().format("%Y-%m-%d-%H%M%S");
    let json_log_file = log_dir.join(format!("host-setup-{}.log", timestamp));
    let txt_log_file = log_dir.join(format!("host-setup-{}.txt", timestamp));

    // stdout stays off in TUI mode so the terminal UI is not corrupted.
    let mut dispatch = fern::Dispatch::new().level(log::LevelFilter::Debug);

    if with_stdout {
        dispatch = dispatch.chain(
            fern::Dispatch::new()
                .level(log::LevelFilter::Info)
                .format(|out, message, record| {
                    let timestamp_local = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
                    let message_str = format!("{}", message);
                    let (phase, step, cleaned_message) =
                        utils::logging::parse_log_metadata(&message_str);
                    let line = utils::logging::format_human_readable_log(
                        &timestamp_local.to_string(),
                        record.level(),
                        record.target(),
                        &cleaned_message,
                        phase.as_deref(),
                        step.as_deref(),
                    );
                    out.finish(format_args!("{}", line));
                })
                .chain(std::io::stdout()),
        );
    }

    dispatch = dispatch
        .chain(
            fern::Dispatch::new()
                .format(|out, message, record| {
                    let message_str = format!("{}", message);
                    let (phase, step, cleaned_message) =
                        utils::logging::parse_log_metadata(&message_str);
                    let json_line = utils::logging::format_json_log(
                        &chrono::Utc::now().to_rfc3339(),
                        record.level(),
                        record.target(),
                        &cleaned_message,
                        phase.as_deref(),
                        step.as_deref(),
                    );
                    out.finish(format_args!("{}\n", json_line));
                })
                .chain(fern::log_file(&json_log_file)?),
        )
        .chain(
            fern::Dispatch::new()
                .format(|out, message, record| {
                    let timestamp_local = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
                    let message_str = format!("{}", message);
                    let (phase, step, cleaned_message) =
                        utils::logging::parse_log_metadata(&message_str);
                    let txt_line = utils::logging::format_human_readable_log(
                        &timestamp_local.to_string(),
                        record.level(),
                        record.target(),
                        &cleaned_message,
                        phase.as_deref(),
                        step.as_deref(),
                    );
                    out.finish(format_args!("{}\n", txt_line));
                })
                .chain(fern::log_file(&txt_log_file)?),
        );

    dispatch.apply()?;

    info!(
        "[PHASE: initialization] Logging initialized, log directory: {:?}",
        log_dir
    );
    Ok(log_dir)
}

fn marker_store(deployment_folder: &Path, settings: &SetupConfig) -> Result<EncryptedMarkerStore> {
    let identity = MachineIdentity::detect().context("Failed to determine machine identity")?;
    let path = path_resolver::marker_path(deployment_folder, &settings.marker.file_name);
    Ok(EncryptedMarkerStore::new(path, &identity))
}

/// Wire the orchestrator with the production PostgreSQL connector and Drive probe.
pub fn build_orchestrator(deployment_folder: &Path) -> Result<SetupOrchestrator> {
    let settings = SetupConfig::load(deployment_folder)?;
    let marker = marker_store(deployment_folder, &settings)?;
    let connector = Arc::new(PgConnector::new(Duration::from_secs(
        settings.database.connect_timeout_secs,
    )));
    let probe = Arc::new(GoogleDriveProbe::new(&settings.cloud));
    let default_local_path =
        path_resolver::default_storage_path(deployment_folder, &settings.storage.data_dir_name);

    info!(
        "[PHASE: initialization] [STEP: wiring] PostgreSQL at {}:{}, target database '{}'",
        settings.database.host, settings.database.port, settings.database.target_database
    );
    Ok(SetupOrchestrator::new(
        settings,
        connector,
        marker,
        probe,
        default_local_path,
    ))
}

/// Interactive terminal wizard.
pub fn run_tui() {
    let deployment_folder = path_resolver::resolve_deployment_folder();
    if let Err(e) = init_logging(&deployment_folder, false) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    info!(
        "[PHASE: initialization] Host setup starting at {}",
        chrono::Utc::now()
    );
    info!(
        "[PHASE: initialization] [STEP: deployment_folder] Deployment folder: {:?}",
        deployment_folder
    );

    let orchestrator = match build_orchestrator(&deployment_folder) {
        Ok(o) => o,
        Err(e) => {
            error!("[PHASE: initialization] [STEP: wiring] {:#}", e);
            eprintln!("Setup error: {:#}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = tui::run(orchestrator) {
        error!("[PHASE: tui] [STEP: fatal] TUI exited with error: {:?}", e);
        eprintln!("Setup error: {}", e);
        std::process::exit(1);
    }
}

/// Non-interactive TUI smoke mode: renders a single frame and exits.
pub fn run_tui_smoke(target: Option<String>) {
    let deployment_folder = path_resolver::resolve_deployment_folder();
    if let Err(e) = init_logging(&deployment_folder, false) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    let target = target.as_deref().unwrap_or("admin");
    if let Err(e) = tui::smoke(target) {
        error!(
            "[PHASE: tui] [STEP: smoke] TUI smoke exited with error: {:?}",
            e
        );
        eprintln!("Setup error: {}", e);
        std::process::exit(1);
    }
}

/// Report whether setup has completed on this machine. Never prints secrets.
/// Returns the process exit code: 0 when the marker exists and decrypts, 1 otherwise.
pub fn run_status() -> i32 {
    let deployment_folder = path_resolver::resolve_deployment_folder();
    if let Err(e) = init_logging(&deployment_folder, false) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to start runtime: {}", e);
            return 1;
        }
    };

    match runtime.block_on(status_report(&deployment_folder)) {
        Ok(report) => {
            for line in &report.lines {
                println!("{}", line);
            }
            if report.complete {
                0
            } else {
                1
            }
        }
        Err(e) => {
            error!("[PHASE: status] [STEP: report] {:#}", e);
            eprintln!("Status check failed: {:#}", e);
            1
        }
    }
}

struct StatusReport {
    complete: bool,
    lines: Vec<String>,
}

async fn status_report(deployment_folder: &Path) -> Result<StatusReport> {
    let settings = SetupConfig::load(deployment_folder)?;
    let store = marker_store(deployment_folder, &settings)?;
    Ok(describe_marker(&store).await)
}

async fn describe_marker(store: &EncryptedMarkerStore) -> StatusReport {
    let mut lines = vec![format!("Marker file: {}", store.path().display())];
    if !store.exists() {
        lines.push("Setup status: not set up".to_string());
        return StatusReport {
            complete: false,
            lines,
        };
    }

    match store.read::<SetupMarker>().await {
        Ok(marker) => {
            if let Ok(info) = store.inspect().await {
                let issued = chrono::DateTime::from_timestamp(info.issued_at as i64, 0)
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| info.issued_at.to_string());
                lines.push(format!("Envelope: v{}, written {}", info.version, issued));
            }
            lines.push("Setup status: complete".to_string());
            lines.push(format!("Database: {}", marker.oddm_db_name));
            lines.push(format!("Service role: {}", marker.oddm_db_user));
            lines.push(format!("Data folder: {}", marker.data_storage_path));
            lines.push(format!(
                "Cloud backup: {}",
                if marker.gdrive_service_json_data.status {
                    "enabled"
                } else {
                    "disabled"
                }
            ));
            StatusReport {
                complete: true,
                lines,
            }
        }
        Err(e) => {
            lines.push(format!(
                "Setup status: marker does not decrypt on this machine ({})",
                e
            ));
            StatusReport {
                complete: false,
                lines,
            }
        }
    }
}
