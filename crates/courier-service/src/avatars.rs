use anyhow::{anyhow, Context, Result};
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

/// Downloads profile pictures into the avatars folder as `<id>.jpg`.
#[derive(Clone)]
pub struct AvatarFetcher {
    client: reqwest::Client,
    dir: PathBuf,
}

impl AvatarFetcher {
    pub fn new(dir: PathBuf, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("courier-service/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .context("build avatar http client")?;
        Ok(Self { client, dir })
    }

    pub fn path_for(&self, id: &str) -> Result<PathBuf> {
        if id.is_empty() || id.contains(['/', '\\']) || id.starts_with('.') {
            return Err(anyhow!("invalid avatar id {id:?}"));
        }
        Ok(self.dir.join(format!("{id}.jpg")))
    }

    pub async fn fetch(&self, id: &str, url: &str) -> Result<PathBuf> {
        let dest = self.path_for(id)?;
        let res = self.client.get(url).send().await?;
        if !res.status().is_success() {
            return Err(anyhow!("avatar download failed: {}", res.status()));
        }
        let bytes = res.bytes().await?;
        tokio::fs::create_dir_all(&self.dir).await?;
        let staging = self.dir.join(format!(".{id}.jpg.part"));
        tokio::fs::write(&staging, &bytes).await?;
        tokio::fs::rename(&staging, &dest).await?;
        debug!(id, bytes = bytes.len(), "avatar downloaded");
        Ok(dest)
    }

    /// Delete every cached picture and leave an empty folder behind.
    pub async fn purge(&self) -> Result<()> {
        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tokio::fs::create_dir_all(&self.dir).await?;
        Ok(())
    }
}
