use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::config::SecretServiceConfig;
use crate::error::SecretError;
use crate::secret_protocol::{
    AccessControlMode, ClientHello, DeviceLockSemantic, InteractionParams, ResultCode,
    SecretHandle, SecretsEnvelope, SecretsRequest, SecretsResponse, UserInteractionMode,
    ERROR_COLLECTION_EXISTS, ERROR_COLLECTION_EXISTS_ALT, ERROR_COLLECTION_OWNED,
    ERROR_INVALID_SECRET, SECRETS_PROTOCOL_VERSION,
};

#[cfg(unix)]
use tokio::io::BufReader;
#[cfg(unix)]
use tokio::net::UnixStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionStatus {
    Created,
    AlreadyExists,
}

/// Capability surface of the secret daemon, one method per remote operation.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn create_collection(&self, handle: &SecretHandle)
        -> Result<CollectionStatus, SecretError>;
    async fn set_secret(&self, handle: &SecretHandle, data: &[u8]) -> Result<(), SecretError>;
    async fn get_secret(&self, handle: &SecretHandle) -> Result<Zeroizing<Vec<u8>>, SecretError>;
    async fn delete_secret(&self, handle: &SecretHandle) -> Result<(), SecretError>;
    async fn delete_collection(&self, handle: &SecretHandle) -> Result<(), SecretError>;
}

/// Races `fut` against `after`; on expiry the in-flight future is dropped,
/// which abandons its connection.
pub async fn with_timeout<T, F>(
    operation: &'static str,
    after: Duration,
    fut: F,
) -> Result<T, SecretError>
where
    F: Future<Output = Result<T, SecretError>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result,
        Err(_) => Err(SecretError::Timeout { operation, after }),
    }
}

/// Client for the secret daemon.
///
/// Holds no connection. Every call dials the peer address found at
/// discovery, says hello, performs one request and hangs up.
#[derive(Debug, Clone)]
pub struct SecretServiceClient {
    peer_address: PathBuf,
    client_id: String,
    call_timeout: Duration,
}

impl SecretServiceClient {
    /// Ask the discovery socket for the peer address and probe it once.
    /// A failure here means the service is unavailable for the process lifetime.
    pub async fn discover(config: &SecretServiceConfig) -> Result<Self, SecretError> {
        let discovery = config.discovery_socket();
        let address = with_timeout(
            "discoverEndpoint",
            config.discovery_timeout(),
            discover_peer(&discovery),
        )
        .await?;
        info!(peer = %address.display(), "secret service peer discovered");

        let client = Self::with_peer(address, &config.client_id, config.call_timeout());
        with_timeout("probe", client.call_timeout, client.probe()).await?;
        info!("secret service ready");
        Ok(client)
    }

    /// Skip discovery when the peer address is already known.
    pub fn with_peer(peer_address: PathBuf, client_id: &str, call_timeout: Duration) -> Self {
        Self {
            peer_address,
            client_id: client_id.to_string(),
            call_timeout,
        }
    }

    pub fn peer_address(&self) -> &Path {
        &self.peer_address
    }

    async fn call(&self, request: SecretsRequest) -> Result<SecretsResponse, SecretError> {
        let operation = request.operation();
        debug!(operation, "secret service call");
        with_timeout(operation, self.call_timeout, self.exchange(request)).await
    }

    #[cfg(unix)]
    async fn probe(&self) -> Result<(), SecretError> {
        let _session = self.connect().await?;
        Ok(())
    }

    #[cfg(unix)]
    async fn exchange(&self, request: SecretsRequest) -> Result<SecretsResponse, SecretError> {
        let (mut reader, mut writer) = self.connect().await?;
        write_envelope(&mut writer, &SecretsEnvelope::Request(request)).await?;
        match read_envelope(&mut reader).await? {
            SecretsEnvelope::Response(response) => Ok(response),
            SecretsEnvelope::Error { message } => Err(SecretError::Protocol(message)),
            _ => Err(SecretError::Protocol("expected Response".into())),
        }
    }

    #[cfg(unix)]
    async fn connect(
        &self,
    ) -> Result<
        (
            BufReader<tokio::io::ReadHalf<UnixStream>>,
            tokio::io::WriteHalf<UnixStream>,
        ),
        SecretError,
    > {
        let stream = UnixStream::connect(&self.peer_address).await?;
        let (read_half, mut writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);

        let hello = SecretsEnvelope::ClientHello(ClientHello {
            protocol_version: SECRETS_PROTOCOL_VERSION,
            client_id: self.client_id.clone(),
        });
        write_envelope(&mut writer, &hello).await?;
        match read_envelope(&mut reader).await? {
            SecretsEnvelope::Welcome(_) => Ok((reader, writer)),
            SecretsEnvelope::Error { message } => Err(SecretError::Protocol(message)),
            _ => Err(SecretError::Protocol("expected Welcome".into())),
        }
    }

    #[cfg(not(unix))]
    async fn probe(&self) -> Result<(), SecretError> {
        Err(SecretError::Unavailable)
    }

    #[cfg(not(unix))]
    async fn exchange(&self, _request: SecretsRequest) -> Result<SecretsResponse, SecretError> {
        Err(SecretError::Unavailable)
    }
}

#[async_trait]
impl SecretStore for SecretServiceClient {
    async fn create_collection(
        &self,
        handle: &SecretHandle,
    ) -> Result<CollectionStatus, SecretError> {
        let response = self
            .call(SecretsRequest::CreateCollection {
                name: handle.collection_name.clone(),
                storage_plugin: handle.plugin.clone(),
                encryption_plugin: handle.plugin.clone(),
                unlock_semantic: DeviceLockSemantic::KeepUnlocked,
                access_control: AccessControlMode::OwnerOnly,
            })
            .await?;
        let result = expect_result("createCollection", response)?;
        if result.succeeded() {
            return Ok(CollectionStatus::Created);
        }
        match result.error_code {
            ERROR_COLLECTION_EXISTS | ERROR_COLLECTION_EXISTS_ALT => {
                Ok(CollectionStatus::AlreadyExists)
            }
            ERROR_COLLECTION_OWNED => Err(SecretError::CollectionConflict),
            _ => Err(remote_error("createCollection", result)),
        }
    }

    async fn set_secret(&self, handle: &SecretHandle, data: &[u8]) -> Result<(), SecretError> {
        let response = self
            .call(SecretsRequest::SetSecret {
                identifier: handle.clone(),
                data: general_purpose::STANDARD.encode(data),
                filter: Default::default(),
                ui: InteractionParams::default(),
                interaction: UserInteractionMode::System,
            })
            .await?;
        check_result("setSecret", response)
    }

    async fn get_secret(&self, handle: &SecretHandle) -> Result<Zeroizing<Vec<u8>>, SecretError> {
        let response = self
            .call(SecretsRequest::GetSecret {
                identifier: handle.clone(),
                interaction: UserInteractionMode::System,
            })
            .await?;
        match response {
            SecretsResponse::Secret { result, data } if result.succeeded() => {
                let encoded = Zeroizing::new(
                    data.ok_or_else(|| SecretError::Protocol("secret without data".into()))?,
                );
                let decoded = general_purpose::STANDARD
                    .decode(encoded.as_bytes())
                    .map_err(|e| SecretError::Protocol(format!("decode secret: {e}")))?;
                Ok(Zeroizing::new(decoded))
            }
            SecretsResponse::Secret { result, .. } | SecretsResponse::Result(result) => {
                if result.error_code == ERROR_INVALID_SECRET {
                    Err(SecretError::NotFound)
                } else {
                    Err(remote_error("getSecret", result))
                }
            }
        }
    }

    async fn delete_secret(&self, handle: &SecretHandle) -> Result<(), SecretError> {
        let response = self
            .call(SecretsRequest::DeleteSecret {
                identifier: handle.clone(),
                interaction: UserInteractionMode::System,
            })
            .await?;
        check_result("deleteSecret", response)
    }

    async fn delete_collection(&self, handle: &SecretHandle) -> Result<(), SecretError> {
        let response = self
            .call(SecretsRequest::DeleteCollection {
                name: handle.collection_name.clone(),
                storage_plugin: handle.plugin.clone(),
                interaction: UserInteractionMode::System,
            })
            .await?;
        check_result("deleteCollection", response)
    }
}

fn expect_result(
    operation: &'static str,
    response: SecretsResponse,
) -> Result<ResultCode, SecretError> {
    match response {
        SecretsResponse::Result(result) => Ok(result),
        SecretsResponse::Secret { .. } => Err(SecretError::Protocol(format!(
            "unexpected secret payload for {operation}"
        ))),
    }
}

fn check_result(operation: &'static str, response: SecretsResponse) -> Result<(), SecretError> {
    let result = expect_result(operation, response)?;
    if result.succeeded() {
        Ok(())
    } else {
        Err(remote_error(operation, result))
    }
}

fn remote_error(operation: &'static str, result: ResultCode) -> SecretError {
    SecretError::Remote {
        operation,
        code: result.code,
        error_code: result.error_code,
        message: result.message,
    }
}

#[cfg(unix)]
async fn discover_peer(discovery_socket: &Path) -> Result<PathBuf, SecretError> {
    let stream = UnixStream::connect(discovery_socket).await.map_err(|e| {
        debug!(socket = %discovery_socket.display(), "discovery connect failed: {e}");
        SecretError::Unavailable
    })?;
    let (read_half, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);
    write_envelope(&mut writer, &SecretsEnvelope::Discover).await?;
    match read_envelope(&mut reader).await? {
        SecretsEnvelope::PeerAddress { address } if !address.is_empty() => {
            Ok(PathBuf::from(address))
        }
        SecretsEnvelope::Error { message } => Err(SecretError::Protocol(message)),
        _ => Err(SecretError::Protocol("expected PeerAddress".into())),
    }
}

#[cfg(not(unix))]
async fn discover_peer(_discovery_socket: &Path) -> Result<PathBuf, SecretError> {
    Err(SecretError::Unavailable)
}

pub(crate) async fn write_envelope<W>(
    writer: &mut W,
    envelope: &SecretsEnvelope,
) -> Result<(), SecretError>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(serde_json::to_string(envelope)?.as_bytes())
        .await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

pub(crate) async fn read_envelope<R>(reader: &mut R) -> Result<SecretsEnvelope, SecretError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Err(SecretError::Protocol("connection closed by peer".into()));
    }
    Ok(serde_json::from_str(line.trim_end())?)
}
