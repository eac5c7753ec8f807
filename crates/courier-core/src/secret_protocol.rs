//! Wire types spoken with the secret daemon.
//!
//! Line-delimited JSON over a Unix socket. Discovery is a single
//! `Discover` / `PeerAddress` exchange on the well-known discovery socket.
//! Every peer connection then carries `ClientHello` / `Welcome` followed by
//! exactly one `Request` / `Response` before it is closed.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const SECRETS_PROTOCOL_VERSION: u32 = 1;

pub const RESULT_SUCCEEDED: i32 = 0;
pub const ERROR_COLLECTION_EXISTS: i32 = 3;
pub const ERROR_COLLECTION_EXISTS_ALT: i32 = 46;
pub const ERROR_COLLECTION_OWNED: i32 = 10;
pub const ERROR_INVALID_SECRET: i32 = 28;

/// Locates a secret inside the remote service. Not itself sensitive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SecretHandle {
    pub secret_name: String,
    pub collection_name: String,
    pub plugin: String,
}

impl SecretHandle {
    pub fn new(
        secret_name: impl Into<String>,
        collection_name: impl Into<String>,
        plugin: impl Into<String>,
    ) -> Self {
        Self {
            secret_name: secret_name.into(),
            collection_name: collection_name.into(),
            plugin: plugin.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceLockSemantic {
    KeepUnlocked,
    Relock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccessControlMode {
    OwnerOnly,
    SystemAccessControl,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserInteractionMode {
    Prevent,
    System,
    Application,
}

/// Prompt parameters; empty for the non-interactive calls this client makes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InteractionParams {
    #[serde(default)]
    pub application_id: String,
    #[serde(default)]
    pub prompt_text: String,
    #[serde(default)]
    pub prompt_trid: HashMap<i32, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientHello {
    pub protocol_version: u32,
    pub client_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Welcome {
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum SecretsEnvelope {
    Discover,
    PeerAddress { address: String },
    ClientHello(ClientHello),
    Welcome(Welcome),
    Error { message: String },
    Request(SecretsRequest),
    Response(SecretsResponse),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "request", content = "data")]
pub enum SecretsRequest {
    CreateCollection {
        name: String,
        storage_plugin: String,
        encryption_plugin: String,
        unlock_semantic: DeviceLockSemantic,
        access_control: AccessControlMode,
    },
    SetSecret {
        identifier: SecretHandle,
        /// base64 (standard alphabet)
        data: String,
        #[serde(default)]
        filter: HashMap<String, String>,
        ui: InteractionParams,
        interaction: UserInteractionMode,
    },
    GetSecret {
        identifier: SecretHandle,
        interaction: UserInteractionMode,
    },
    DeleteSecret {
        identifier: SecretHandle,
        interaction: UserInteractionMode,
    },
    DeleteCollection {
        name: String,
        storage_plugin: String,
        interaction: UserInteractionMode,
    },
}

impl SecretsRequest {
    pub fn operation(&self) -> &'static str {
        match self {
            SecretsRequest::CreateCollection { .. } => "createCollection",
            SecretsRequest::SetSecret { .. } => "setSecret",
            SecretsRequest::GetSecret { .. } => "getSecret",
            SecretsRequest::DeleteSecret { .. } => "deleteSecret",
            SecretsRequest::DeleteCollection { .. } => "deleteCollection",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultCode {
    pub code: i32,
    #[serde(default)]
    pub error_code: i32,
    #[serde(default)]
    pub message: String,
}

impl ResultCode {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn failed(error_code: i32, message: impl Into<String>) -> Self {
        Self {
            code: 1,
            error_code,
            message: message.into(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.code == RESULT_SUCCEEDED
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "response", content = "data")]
pub enum SecretsResponse {
    Result(ResultCode),
    Secret {
        result: ResultCode,
        #[serde(default)]
        data: Option<String>,
    },
}
