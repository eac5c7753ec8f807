use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use courier_core::paths::data_dir;
use courier_core::{CoreContext, CourierConfig};
use courier_service::control::{self, ControlRequest, ControlResponse};
use courier_service::ingest::spawn_ingest;
use courier_service::{Backend, MessagingClient, OfflineClient};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Courier messaging daemon", long_about = None)]
struct Cli {
    /// Data directory holding the encrypted state and the control socket
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the background daemon
    Run,
    /// Connection, key and cache status
    Status,
    /// Conversation list, newest first
    Chats,
    /// Stored messages
    Messages {
        /// Only messages of this conversation
        #[arg(long)]
        chat: Option<String>,
    },
    /// Known contact names
    Contacts,
    /// Local path of a cached or freshly fetched avatar
    Avatar { id: String },
    /// Send a text message
    Send { to: String, text: String },
    /// Send a file as media
    SendMedia {
        to: String,
        path: PathBuf,
        #[arg(long, default_value = "")]
        caption: String,
    },
    /// Reload contacts and group names from the server
    ReloadContacts,
    /// Generate a new encryption key and re-encrypt all state
    RotateKey,
    /// Sign out and wipe local state
    Logout,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let cli = Cli::parse();
    let data = match cli.data_dir {
        Some(dir) => dir,
        None => data_dir()?,
    };

    let request = match cli.command {
        Commands::Run => return run_command(&data).await,
        Commands::Status => ControlRequest::Status,
        Commands::Chats => ControlRequest::Chats,
        Commands::Messages { chat } => ControlRequest::Messages { chat },
        Commands::Contacts => ControlRequest::Contacts,
        Commands::Avatar { id } => ControlRequest::Avatar { id },
        Commands::Send { to, text } => ControlRequest::SendText { to, text },
        Commands::SendMedia { to, path, caption } => ControlRequest::SendMedia {
            to,
            path: std::env::current_dir()?.join(path),
            caption,
        },
        Commands::ReloadContacts => ControlRequest::ReloadContacts,
        Commands::RotateKey => ControlRequest::RotateKey,
        Commands::Logout => ControlRequest::Logout,
    };
    client_command(&data, request).await
}

async fn run_command(data: &Path) -> Result<()> {
    std::fs::create_dir_all(data)?;
    let config = CourierConfig::load(data)?;
    let media = config.media.paths()?;
    let core = CoreContext::init(config).await?;

    let client: Arc<dyn MessagingClient> = Arc::new(OfflineClient);
    let events = client.take_events();
    let backend = Arc::new(Backend::new(core, client, media)?);

    let socket_path = control::socket_path(data);
    let control_task = control::spawn_control_server(backend.clone(), socket_path.clone())?;
    let ingest_task = events.map(|events| spawn_ingest(backend.clone(), events));
    if ingest_task.is_none() {
        warn!("no messaging client linked; serving cached state only");
    }

    info!(data_dir = %data.display(), "service started");
    signal::ctrl_c().await?;
    info!("service stopping");
    control_task.abort();
    if let Some(task) = ingest_task {
        task.abort();
    }

    let flushing = backend.clone();
    tokio::task::spawn_blocking(move || flushing.shutdown()).await?;
    let _ = std::fs::remove_file(&socket_path);
    Ok(())
}

async fn client_command(data: &Path, request: ControlRequest) -> Result<()> {
    let response = control::request(&control::socket_path(data), &request).await?;
    if let ControlResponse::Error { message } = response {
        return Err(anyhow!(message));
    }
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}
