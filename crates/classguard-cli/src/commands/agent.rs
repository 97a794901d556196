//! Agent lifecycle: the native-messaging host process and the commands that
//! talk to it over the control socket.

use anyhow::{Context, Result};
use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use sysinfo::{Pid, System};
use tabled::{Table, Tabled};

use classguard_core::{
    config::get_data_dir,
    daemon::socket_path,
    host::bridge::NativeMessagingHost,
    ipc::{AgentStatus, IpcClient, IpcRequest, IpcResponse},
    state::StateActor,
    Agent, AgentConfig, AgentParts,
};
use classguard_integrations::BackendClient;
use classguard_storage::Database;

pub const PID_FILE: &str = "classguard.pid";
pub const LOG_FILE: &str = "classguard.log";

/// How long a single request to the browser may take.
const HOST_CALL_TIMEOUT: Duration = Duration::from_secs(10);

#[must_use]
pub fn pid_file_path(data_dir: &Path) -> PathBuf {
    data_dir.join(PID_FILE)
}

/// Record the current process as the running agent.
///
/// # Errors
///
/// Returns an error if the pid file cannot be written.
pub fn write_pid(data_dir: &Path) -> io::Result<()> {
    fs::write(pid_file_path(data_dir), std::process::id().to_string())
}

/// PID from the pid file, if present and readable.
#[must_use]
pub fn read_pid(data_dir: &Path) -> Option<usize> {
    fs::read_to_string(pid_file_path(data_dir))
        .ok()?
        .trim()
        .parse()
        .ok()
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn process_alive(pid: usize) -> bool {
    let mut sys = System::new();
    sys.refresh_process(Pid::from(pid))
}

/// Entry point when the browser launches us as its native-messaging host.
///
/// # Errors
///
/// Returns an error if logging, the store, the backend client or the control
/// socket cannot be set up.
pub async fn run_host_process() -> Result<()> {
    // stdout carries the protocol; logs must never reach it.
    setup_host_logging().context("Failed to set up host logging")?;
    log::info!("Native-messaging host started.");

    if let Err(e) = host_main_logic().await {
        log::error!("Host exited with a fatal error: {e:#}");
        return Err(e);
    }
    Ok(())
}

async fn host_main_logic() -> Result<()> {
    let data_dir = get_data_dir()?;
    fs::create_dir_all(&data_dir)
        .with_context(|| format!("Failed to create {}", data_dir.display()))?;

    let config = AgentConfig::load_default()?;
    let backend = BackendClient::new(
        &config.backend.base_url,
        Duration::from_secs(config.backend.timeout_secs),
    )?;
    let state = StateActor::spawn(Database::open_in(&data_dir)?);

    let (host, events) = NativeMessagingHost::stdio(HOST_CALL_TIMEOUT);
    let host = Arc::new(host);
    let agent = Arc::new(Agent::new(AgentParts {
        config,
        backend: Arc::new(backend),
        host: host.clone(),
        rule_engine: host.clone(),
        identity: host,
        state,
    }));

    write_pid(&data_dir).context("Failed to write pid file")?;
    let result = agent.run(events, &socket_path(&data_dir)).await;
    if let Err(e) = remove_if_exists(&pid_file_path(&data_dir)) {
        log::warn!("Failed to remove pid file: {e}");
    }
    result
}

fn setup_host_logging() -> Result<()> {
    use std::fs::{create_dir_all, OpenOptions};

    let log_path = get_data_dir()?.join(LOG_FILE);

    if let Some(parent) = log_path.parent() {
        create_dir_all(parent)?;
    }

    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    env_logger::Builder::from_default_env()
        .target(env_logger::Target::Pipe(Box::new(log_file)))
        .filter_level(log::LevelFilter::Debug)
        .init();

    Ok(())
}

/// Ask the running agent to shut down, killing it if it does not comply.
///
/// # Errors
///
/// Returns an error if the pid or socket file cannot be cleaned up.
pub async fn stop_agent(data_dir: &Path) -> Result<()> {
    let pid_path = pid_file_path(data_dir);
    let sock_path = socket_path(data_dir);

    let Some(pid) = read_pid(data_dir) else {
        log::info!("Agent is not running (no PID file).");
        remove_if_exists(&sock_path)?;
        return Ok(());
    };

    log::info!("Stopping classguard agent (PID: {pid})...");
    let client = IpcClient::new(&sock_path);

    match client.send_command(IpcRequest::Shutdown).await {
        Ok(IpcResponse::Shutdown) => {
            log::info!("Shutdown signal sent. Waiting for process to exit...");
            tokio::time::sleep(Duration::from_secs(2)).await;

            let mut sys = System::new();
            if sys.refresh_process(Pid::from(pid)) {
                log::warn!("Agent did not stop gracefully. Force killing...");
                if let Some(process) = sys.process(Pid::from(pid)) {
                    process.kill();
                }
            } else {
                log::info!("Agent stopped successfully.");
            }
        }
        Ok(resp) => log::error!("Received unexpected response from agent: {resp:?}"),
        Err(e) => {
            log::error!("Failed to send shutdown command: {e}. Forcing cleanup.");
            let mut sys = System::new();
            if sys.refresh_process(Pid::from(pid)) {
                if let Some(process) = sys.process(Pid::from(pid)) {
                    process.kill();
                    log::info!("Process killed.");
                }
            }
        }
    }

    remove_if_exists(&pid_path)?;
    remove_if_exists(&sock_path)?;
    Ok(())
}

#[derive(Tabled)]
pub struct StatusRow {
    #[tabled(rename = "Field")]
    field: &'static str,
    #[tabled(rename = "Value")]
    value: String,
}

fn row(field: &'static str, value: impl Into<String>) -> StatusRow {
    StatusRow {
        field,
        value: value.into(),
    }
}

#[must_use]
pub fn status_rows(status: &AgentStatus, pid: Option<usize>) -> Vec<StatusRow> {
    let none = || "None".to_string();
    vec![
        row("Agent", if status.running { "Running" } else { "Stopping" }),
        row("PID", pid.map_or_else(none, |p| p.to_string())),
        row("Student", status.student.clone().unwrap_or_else(none)),
        row("Mode", status.mode.clone()),
        row("Enabled", if status.enabled { "yes" } else { "no" }),
        row("Safe mode", status.safe_mode.clone().unwrap_or_else(none)),
        row("Last sync", status.last_sync.clone().unwrap_or_else(|| "never".to_string())),
        row("Rules", status.rule_count.to_string()),
        row("Bypass grants", status.bypass_grants.to_string()),
    ]
}

/// Print the running agent's status.
///
/// # Errors
///
/// Returns an error if the agent replies with something other than a status.
pub async fn show_status(data_dir: &Path) -> Result<()> {
    let sock_path = socket_path(data_dir);

    if !sock_path.exists() {
        println!("Agent Status: Not running");
        return Ok(());
    }

    let client = IpcClient::new(&sock_path);
    match client.send_command(IpcRequest::Status).await {
        Ok(IpcResponse::Status(status)) => {
            let pid = read_pid(data_dir).filter(|pid| process_alive(*pid));
            println!("{}", Table::new(status_rows(&status, pid)));
        }
        Ok(_) => anyhow::bail!("Unexpected response from agent"),
        Err(e) => {
            log::error!("Failed to get status: {e}");
            println!("Agent Status: Not running (or not responding)");
        }
    }
    Ok(())
}

/// Ask the running agent to resolve the student identity again.
///
/// # Errors
///
/// Returns an error if the agent cannot be reached.
pub async fn refresh_identity(data_dir: &Path) -> Result<()> {
    let client = IpcClient::new(&socket_path(data_dir));
    match client
        .send_command(IpcRequest::RefreshIdentity)
        .await
        .context("Agent is not running")?
    {
        IpcResponse::Identity {
            ok: true,
            student: Some(student),
        } => println!("Identity resolved: {student}"),
        IpcResponse::Identity { .. } => {
            println!("Identity could not be resolved; the agent stays in safe mode.");
        }
        other => anyhow::bail!("Unexpected response from agent: {other:?}"),
    }
    Ok(())
}
