use directories::{ProjectDirs, UserDirs};
use std::path::{Path, PathBuf};

pub const APP_QUALIFIER: &str = "org";
pub const APP_ORG: &str = "courier";
pub const APP_NAME: &str = "courier";

/// Folder name used under each of the user's media directories.
pub const MEDIA_FOLDER: &str = "Courier";

pub fn data_dir() -> anyhow::Result<PathBuf> {
    if let Ok(override_path) = std::env::var("COURIER_DATA_DIR") {
        return Ok(PathBuf::from(override_path));
    }
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)
        .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
    Ok(dirs.data_dir().to_path_buf())
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join("config.json")
}

/// Well-known socket on which the secret daemon answers discovery requests.
pub fn secrets_discovery_socket() -> PathBuf {
    if let Ok(override_path) = std::env::var("COURIER_SECRETS_DISCOVERY") {
        return PathBuf::from(override_path);
    }
    let runtime = std::env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir);
    runtime.join("secrets").join("discovery.sock")
}

/// Destination folders for downloaded media and cached avatars.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaPaths {
    pub pictures: PathBuf,
    pub videos: PathBuf,
    pub audio: PathBuf,
    pub documents: PathBuf,
    pub avatars: PathBuf,
}

impl MediaPaths {
    /// Everything under one root, e.g. a test directory or a configured override.
    pub fn under(root: &Path) -> Self {
        let pictures = root.join("Pictures").join(MEDIA_FOLDER);
        Self {
            avatars: pictures.join("avatars"),
            pictures,
            videos: root.join("Videos").join(MEDIA_FOLDER),
            audio: root.join("Music").join(MEDIA_FOLDER),
            documents: root.join("Documents").join(MEDIA_FOLDER),
        }
    }

    /// The user's standard media directories, falling back to `$HOME/<kind>`.
    pub fn from_user_dirs() -> anyhow::Result<Self> {
        let user =
            UserDirs::new().ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
        let home = user.home_dir().to_path_buf();
        let pick = |dir: Option<&Path>, fallback: &str| {
            dir.map(Path::to_path_buf)
                .unwrap_or_else(|| home.join(fallback))
                .join(MEDIA_FOLDER)
        };
        let pictures = pick(user.picture_dir(), "Pictures");
        Ok(Self {
            avatars: pictures.join("avatars"),
            pictures,
            videos: pick(user.video_dir(), "Videos"),
            audio: pick(user.audio_dir(), "Music"),
            documents: pick(user.document_dir(), "Documents"),
        })
    }

    pub fn ensure(&self) -> std::io::Result<()> {
        for dir in [
            &self.pictures,
            &self.videos,
            &self.audio,
            &self.documents,
            &self.avatars,
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// Folder a downloaded file of the given MIME type belongs in.
    pub fn for_mime(&self, mime_type: &str) -> &Path {
        if mime_type.starts_with("image/") {
            &self.pictures
        } else if mime_type.starts_with("video/") {
            &self.videos
        } else if mime_type.starts_with("audio/") {
            &self.audio
        } else {
            &self.documents
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_prefix_selects_folder() {
        let paths = MediaPaths::under(Path::new("/tmp/media"));
        assert_eq!(paths.for_mime("image/jpeg"), paths.pictures.as_path());
        assert_eq!(paths.for_mime("video/mp4"), paths.videos.as_path());
        assert_eq!(paths.for_mime("audio/ogg; codecs=opus"), paths.audio.as_path());
        assert_eq!(paths.for_mime("application/pdf"), paths.documents.as_path());
        assert!(paths.avatars.starts_with(&paths.pictures));
    }
}
