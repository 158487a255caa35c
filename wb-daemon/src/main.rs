//! wbooster Daemon (wboosterd)
//!
//! Privileged service that owns the write-booster controller for one UFS
//! device and exposes it over a Unix domain socket.
//!
//! # Security Model
//! - **Privilege**: runs as root for sysfs write access (not required with `--simulate`)
//! - **Socket**: symlink-safe creation, group read/write only
//! - **Audit**: peer credential logging (UID/GID/PID) for every write request
//! - **Limits**: connection and message size limits, read/write timeouts
//! - **Isolation**: restrictive umask, sanitized environment for hooks
//! - **Signals**: SIGINT/SIGTERM switch the write booster off before exit

mod hook;
mod io_monitor;
mod server;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use tracing::{debug, error, info, warn};
use wb_core::constants::paths;
use wb_core::{
    load_settings_from, settings_path, BlockDevice, Controller, Settings, SimDevice, SysfsDevice,
};

use crate::hook::CommandHook;
use crate::io_monitor::MonitorState;
use crate::server::ServerContext;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Environment variable selecting the log filter
const LOG_ENV: &str = "WBOOSTER_LOG";

// ============================================================================
// Security Hardening
// ============================================================================

/// Remove variables that could influence hook processes
fn sanitize_environment() {
    const DANGEROUS_VARS: &[&str] = &[
        "LD_PRELOAD",
        "LD_LIBRARY_PATH",
        "LD_AUDIT",
        "LD_DEBUG",
        "IFS",
    ];

    for var in DANGEROUS_VARS {
        std::env::remove_var(var);
    }
    std::env::set_var("PATH", "/usr/sbin:/usr/bin:/sbin:/bin");
}

fn set_secure_umask() {
    // SAFETY: umask only replaces the process file creation mask.
    unsafe { libc::umask(0o077) };
}

fn verify_privileges() -> Result<(), &'static str> {
    // SAFETY: geteuid has no preconditions.
    let euid = unsafe { libc::geteuid() };
    if euid != 0 {
        return Err("Daemon must run as root (euid=0) to write the wb_on attribute");
    }
    Ok(())
}

/// Validate socket path for security
fn validate_socket_path(path: &str) -> Result<(), String> {
    let p = Path::new(path);

    if !p.is_absolute() {
        return Err("Socket path must be absolute".into());
    }
    if path.contains("..") {
        return Err("Socket path contains path traversal".into());
    }
    if path.contains('\0') {
        return Err("Socket path contains null byte".into());
    }

    let safe_dirs = ["/run/", "/var/run/", "/tmp/"];
    if !safe_dirs.iter().any(|d| path.starts_with(d)) {
        return Err(format!("Socket path must be under {:?}", safe_dirs));
    }

    if let Some(parent) = p.parent() {
        if !parent.exists() {
            return Err(format!("Parent directory does not exist: {:?}", parent));
        }
    }

    if p.symlink_metadata()
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false)
    {
        return Err("Socket path is a symlink - refusing for security".into());
    }

    Ok(())
}

fn cleanup(socket_path: &str) {
    if Path::new(socket_path).exists() {
        if let Err(e) = std::fs::remove_file(socket_path) {
            warn!("Failed to remove socket: {}", e);
        }
    }
    info!("Cleanup complete");
}

// ============================================================================
// CLI
// ============================================================================

struct Args {
    config: Option<PathBuf>,
    socket: Option<String>,
    simulate: bool,
}

fn print_help() {
    eprintln!("wboosterd {} - write-booster admission control daemon", VERSION);
    eprintln!();
    eprintln!("USAGE:");
    eprintln!("    wboosterd [OPTIONS]");
    eprintln!();
    eprintln!("OPTIONS:");
    eprintln!("    -c, --config PATH   Settings file (default: ${} or {})", paths::CONFIG_ENV, paths::CONFIG_FILE);
    eprintln!("    -s, --socket PATH   Socket path (default: {})", paths::DEFAULT_SOCKET);
    eprintln!("        --simulate      Drive an in-memory device instead of sysfs");
    eprintln!("    -v, --version       Print version");
    eprintln!("    -h, --help          Print this help");
    eprintln!();
    eprintln!("ENVIRONMENT:");
    eprintln!("    {}        Log filter (trace, debug, info, warn, error)", LOG_ENV);
}

fn print_version() {
    println!("wboosterd {}", VERSION);
}

/// Returns None when the process should exit successfully right away
fn parse_args() -> anyhow::Result<Option<Args>> {
    let mut args = Args {
        config: None,
        socket: None,
        simulate: false,
    };

    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-h" | "--help" => {
                print_help();
                return Ok(None);
            }
            "-v" | "--version" => {
                print_version();
                return Ok(None);
            }
            "-c" | "--config" => {
                let path = iter.next().context("--config requires a path argument")?;
                args.config = Some(PathBuf::from(path));
            }
            "-s" | "--socket" => {
                args.socket = Some(iter.next().context("--socket requires a path argument")?);
            }
            "--simulate" => args.simulate = true,
            other => {
                print_help();
                bail!("Unknown argument: {}", other);
            }
        }
    }
    Ok(Some(args))
}

// ============================================================================
// Logging
// ============================================================================

/// Journald when available, stdout otherwise. Returns true for journald.
fn init_logging(log_level: &str) -> bool {
    if Path::new("/run/systemd/journal/socket").exists() {
        match tracing_journald::layer() {
            Ok(journald_layer) => {
                use tracing_subscriber::prelude::*;
                tracing_subscriber::registry()
                    .with(journald_layer)
                    .with(tracing_subscriber::EnvFilter::new(log_level))
                    .init();
                return true;
            }
            Err(e) => {
                eprintln!("Failed to create journald layer: {}, falling back to stdout", e);
            }
        }
    }

    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_env_filter(log_level)
        .init();
    false
}

// ============================================================================
// Controller Setup
// ============================================================================

fn start_controller<D: BlockDevice>(device: Arc<D>, settings: &Settings) -> anyhow::Result<Controller> {
    let config = settings.controller.to_config();
    let controller = match &settings.daemon.state_hook {
        Some(program) => {
            let hook = CommandHook::new(program.clone())?;
            info!("STARTUP: State hook: {}", program.display());
            Controller::spawn_with_observer(device, config, Arc::new(hook))?
        }
        None => Controller::spawn(device, config)?,
    };
    Ok(controller)
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!("Failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("SIGNAL: Received SIGINT"),
        _ = term.recv() => info!("SIGNAL: Received SIGTERM"),
    }
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    sanitize_environment();
    set_secure_umask();

    let Some(args) = parse_args()? else {
        return Ok(());
    };

    let log_level = std::env::var(LOG_ENV).unwrap_or_else(|_| "info".to_string());
    let use_journald = init_logging(&log_level);

    info!("STARTUP: wboosterd {} starting", VERSION);
    info!("STARTUP: Logging to {}", if use_journald { "systemd journal" } else { "stdout" });

    let config_path = args.config.unwrap_or_else(settings_path);
    let settings = load_settings_from(&config_path)
        .with_context(|| format!("Failed to load settings from {}", config_path.display()))?;
    info!("STARTUP: Settings: {}", config_path.display());

    if !args.simulate {
        if let Err(e) = verify_privileges() {
            error!("{}", e);
            bail!(e);
        }
    }

    let socket_path = args
        .socket
        .or_else(|| {
            settings
                .daemon
                .socket_path
                .as_ref()
                .map(|p| p.display().to_string())
        })
        .unwrap_or_else(|| paths::DEFAULT_SOCKET.to_string());
    if let Err(e) = validate_socket_path(&socket_path) {
        error!("Invalid socket path: {}", e);
        bail!("Invalid socket path: {}", e);
    }

    let controller = if args.simulate {
        info!("STARTUP: Simulated device");
        start_controller(Arc::new(SimDevice::new("sim0")), &settings)?
    } else {
        let device = SysfsDevice::from_settings(&settings.device)
            .context("Write-booster device not available")?;
        info!(
            "STARTUP: Device {} via {}",
            settings.device.block_device,
            settings.device.wb_on_path.display()
        );
        start_controller(Arc::new(device), &settings)?
    };

    let monitor = Arc::new(MonitorState::new(
        config_path,
        settings.daemon.poll_interval_ms,
    ));
    let monitor_handle = tokio::spawn(io_monitor::run_monitor_loop(
        monitor.clone(),
        controller.clone(),
    ));

    let ctx = ServerContext {
        controller: controller.clone(),
        monitor: monitor.clone(),
    };
    let result = server::run_server(&socket_path, ctx, shutdown_signal()).await;

    info!("SHUTDOWN: Stopping controller");
    monitor.stop();
    if let Err(e) = monitor_handle.await {
        warn!("Poke loop ended abnormally: {}", e);
    }
    if let Err(e) = controller.shutdown().await {
        error!("Controller shutdown failed: {}", e);
    }
    debug!("Write booster left {}", controller.wb_state());

    cleanup(&socket_path);

    if let Err(e) = result {
        error!("Server error: {}", e);
        bail!("Server error: {}", e);
    }

    info!("SHUTDOWN: Daemon terminated gracefully");
    Ok(())
}
