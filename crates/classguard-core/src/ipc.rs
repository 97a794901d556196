use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{UnixListener, UnixStream},
};

/// Socket file name inside the data directory.
pub const SOCKET_NAME: &str = "classguard.sock";

/// IPC request from CLI to the running agent
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum IpcRequest {
    Status,
    Shutdown,
    /// Re-run identity resolution, leaving safe mode if it now succeeds.
    RefreshIdentity,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentStatus {
    pub running: bool,
    pub student: Option<String>,
    pub mode: String,
    /// Cleared by the backend's global toggle.
    pub enabled: bool,
    pub safe_mode: Option<String>,
    /// RFC 3339 time of the last applied policy.
    pub last_sync: Option<String>,
    pub rule_count: usize,
    pub bypass_grants: usize,
}

/// IPC response from the agent to CLI
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum IpcResponse {
    Status(AgentStatus),
    Shutdown,
    Identity { ok: bool, student: Option<String> },
}

/// Answers requests arriving on the socket.
#[async_trait]
pub trait IpcService: Send + Sync {
    async fn handle_request(&self, request: IpcRequest) -> IpcResponse;
}

#[derive(Debug)]
pub struct IpcClient {
    sock_path: PathBuf,
}

impl IpcClient {
    #[must_use]
    pub fn new(sock_path: &Path) -> Self {
        Self {
            sock_path: sock_path.to_path_buf(),
        }
    }

    /// Send one request and wait for the reply.
    ///
    /// # Errors
    ///
    /// Returns an error if the agent is not listening or the reply does not decode.
    pub async fn send_command(&self, request: IpcRequest) -> Result<IpcResponse> {
        let mut stream = UnixStream::connect(&self.sock_path).await?;

        let encoded = bincode::serialize(&request)?;
        stream.write_all(&encoded).await?;
        stream.shutdown().await?;

        let mut buffer = Vec::new();
        stream.read_to_end(&mut buffer).await?;
        let response: IpcResponse = bincode::deserialize(&buffer)?;

        Ok(response)
    }
}

async fn respond(
    service: &dyn IpcService,
    stream: &mut UnixStream,
    request: IpcRequest,
) -> Result<()> {
    let response = service.handle_request(request).await;
    let encoded = bincode::serialize(&response)?;
    stream.write_all(&encoded).await?;
    Ok(())
}

/// Bind the control socket, replacing a stale socket file.
///
/// # Errors
///
/// Returns an error if the stale file cannot be removed or the socket cannot be bound.
pub fn bind(sock_path: &Path) -> io::Result<UnixListener> {
    if sock_path.exists() {
        fs::remove_file(sock_path)?;
    }
    let listener = UnixListener::bind(sock_path)?;
    log::debug!("IPC listening on {}", sock_path.display());
    Ok(listener)
}

/// Serve `service` on `sock_path`.
///
/// # Errors
///
/// Returns an error if the socket cannot be bound.
pub async fn listen(service: Arc<dyn IpcService>, sock_path: &Path) -> io::Result<()> {
    let listener = bind(sock_path)?;
    serve(listener, service).await;
    Ok(())
}

/// Accept connections forever, one request per connection.
pub async fn serve(listener: UnixListener, service: Arc<dyn IpcService>) {
    loop {
        match listener.accept().await {
            Ok((mut stream, _)) => {
                let service = service.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0; 1024];
                    match stream.read(&mut buf).await {
                        Ok(n) if n > 0 => match bincode::deserialize::<IpcRequest>(&buf[..n]) {
                            Ok(request) => {
                                if let Err(e) = respond(service.as_ref(), &mut stream, request).await
                                {
                                    log::error!("IPC handle error: {e}");
                                }
                            }
                            Err(e) => {
                                log::error!("IPC deserialize error: {e}");
                            }
                        },
                        Ok(_) => {} // Connection closed
                        Err(e) => {
                            log::error!("IPC read error: {e}");
                        }
                    }
                });
            }
            Err(e) => {
                log::error!("IPC accept error: {e}");
            }
        }
    }
}
