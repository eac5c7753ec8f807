//! Local control socket used by the CLI subcommands.
//!
//! One JSON request line in, one JSON response line out, then the connection
//! closes. The socket lives in the data directory with mode 0600.

use anyhow::{anyhow, Result};
use courier_core::{Chat, Message};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::backend::{Backend, ServiceStatus};

#[cfg(unix)]
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};
#[cfg(unix)]
use tracing::{debug, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub fn socket_path(data_dir: &Path) -> PathBuf {
    data_dir.join("control.sock")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "request", content = "data")]
pub enum ControlRequest {
    Status,
    Chats,
    Messages { chat: Option<String> },
    Contacts,
    Avatar { id: String },
    SendText { to: String, text: String },
    SendMedia { to: String, path: PathBuf, caption: String },
    ReloadContacts,
    RotateKey,
    Logout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "response", content = "data")]
pub enum ControlResponse {
    Status(ServiceStatus),
    Chats(Vec<Chat>),
    Messages(Vec<Message>),
    Contacts(HashMap<String, String>),
    Avatar { path: Option<PathBuf> },
    Sent(Message),
    ContactsReloaded { count: usize },
    KeyRotated { fingerprint: String },
    LoggedOut,
    Error { message: String },
}

pub async fn dispatch(backend: &Arc<Backend>, request: ControlRequest) -> ControlResponse {
    let result: Result<ControlResponse> = match request {
        ControlRequest::Status => Ok(ControlResponse::Status(backend.status())),
        ControlRequest::Chats => Ok(ControlResponse::Chats(backend.get_chats())),
        ControlRequest::Messages { chat } => {
            Ok(ControlResponse::Messages(backend.get_messages(chat.as_deref())))
        }
        ControlRequest::Contacts => Ok(ControlResponse::Contacts(backend.get_contacts())),
        ControlRequest::Avatar { id } => Ok(ControlResponse::Avatar {
            path: backend.get_avatar(&id).await,
        }),
        ControlRequest::SendText { to, text } => backend
            .send_text(&to, &text)
            .await
            .map(ControlResponse::Sent)
            .map_err(Into::into),
        ControlRequest::SendMedia { to, path, caption } => backend
            .send_media(&to, &path, &caption)
            .await
            .map(ControlResponse::Sent),
        ControlRequest::ReloadContacts => backend
            .reload_contacts()
            .await
            .map(|count| ControlResponse::ContactsReloaded { count })
            .map_err(Into::into),
        ControlRequest::RotateKey => backend
            .rotate_key()
            .await
            .map(|fingerprint| ControlResponse::KeyRotated { fingerprint }),
        ControlRequest::Logout => {
            backend.logout().await;
            Ok(ControlResponse::LoggedOut)
        }
    };
    result.unwrap_or_else(|e| ControlResponse::Error {
        message: format!("{e:#}"),
    })
}

#[cfg(unix)]
pub fn spawn_control_server(backend: Arc<Backend>, socket_path: PathBuf) -> Result<JoinHandle<()>> {
    use std::os::unix::fs::PermissionsExt;

    if socket_path.exists() {
        let _ = std::fs::remove_file(&socket_path);
    }
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let listener = UnixListener::bind(&socket_path)?;
    std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o600))?;

    let task = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let backend = backend.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(&backend, stream).await {
                            debug!("control connection: {e}");
                        }
                    });
                }
                Err(e) => {
                    warn!("control socket accept error: {e}");
                    break;
                }
            }
        }
    });
    Ok(task)
}

#[cfg(not(unix))]
pub fn spawn_control_server(_: Arc<Backend>, _: PathBuf) -> Result<JoinHandle<()>> {
    Err(anyhow!("control socket is only available on unix"))
}

#[cfg(unix)]
async fn serve_connection(backend: &Arc<Backend>, stream: UnixStream) -> Result<()> {
    let (read_half, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Ok(());
    }
    let response = match serde_json::from_str::<ControlRequest>(line.trim_end()) {
        Ok(request) => dispatch(backend, request).await,
        Err(e) => ControlResponse::Error {
            message: format!("invalid request: {e}"),
        },
    };
    let mut payload = serde_json::to_vec(&response)?;
    payload.push(b'\n');
    writer.write_all(&payload).await?;
    writer.shutdown().await?;
    Ok(())
}

/// Send one request to a running daemon.
#[cfg(unix)]
pub async fn request(socket_path: &Path, request: &ControlRequest) -> Result<ControlResponse> {
    let exchange = async {
        let stream = UnixStream::connect(socket_path).await.map_err(|e| {
            anyhow!(
                "cannot reach daemon at {} ({e}); is `courier-service run` active?",
                socket_path.display()
            )
        })?;
        let (read_half, mut writer) = tokio::io::split(stream);
        let mut payload = serde_json::to_vec(request)?;
        payload.push(b'\n');
        writer.write_all(&payload).await?;
        writer.flush().await?;

        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Err(anyhow!("daemon closed the connection without answering"));
        }
        Ok(serde_json::from_str(line.trim_end())?)
    };
    tokio::time::timeout(REQUEST_TIMEOUT, exchange)
        .await
        .map_err(|_| anyhow!("daemon did not answer within {REQUEST_TIMEOUT:?}"))?
}

#[cfg(not(unix))]
pub async fn request(_: &Path, _: &ControlRequest) -> Result<ControlResponse> {
    Err(anyhow!("control socket is only available on unix"))
}
