use chrono::Utc;
use courier_core::paths::MediaPaths;
use std::path::{Path, PathBuf};

const MIME_EXTENSIONS: &[(&str, &str)] = &[
    ("image/jpeg", "jpg"),
    ("image/png", "png"),
    ("image/gif", "gif"),
    ("image/webp", "webp"),
    ("image/bmp", "bmp"),
    ("image/svg+xml", "svg"),
    ("video/mp4", "mp4"),
    ("video/x-matroska", "mkv"),
    ("video/x-msvideo", "avi"),
    ("video/quicktime", "mov"),
    ("video/webm", "webm"),
    ("video/3gpp", "3gp"),
    ("audio/mpeg", "mp3"),
    ("audio/ogg", "ogg"),
    ("audio/wav", "wav"),
    ("audio/flac", "flac"),
    ("audio/aac", "aac"),
    ("audio/mp4", "m4a"),
    ("audio/opus", "opus"),
    ("application/pdf", "pdf"),
    ("application/msword", "doc"),
    (
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "docx",
    ),
    ("application/vnd.ms-excel", "xls"),
    (
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "xlsx",
    ),
    ("application/vnd.ms-powerpoint", "ppt"),
    (
        "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        "pptx",
    ),
    ("application/zip", "zip"),
    ("application/vnd.rar", "rar"),
    ("application/x-7z-compressed", "7z"),
    ("application/vnd.android.package-archive", "apk"),
    ("text/plain", "txt"),
    ("text/csv", "csv"),
    ("application/json", "json"),
];

/// Extension (without dot) for a MIME type; `bin` if unknown. Parameters
/// such as `; codecs=opus` are ignored.
pub fn extension_for(mime_type: &str) -> &'static str {
    let essence = mime_type.split(';').next().unwrap_or_default().trim();
    MIME_EXTENSIONS
        .iter()
        .find(|(mime, _)| *mime == essence)
        .map(|(_, ext)| *ext)
        .unwrap_or("bin")
}

pub fn mime_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("jpeg") => "image/jpeg",
        Some(ext) => MIME_EXTENSIONS
            .iter()
            .find(|(_, known)| *known == ext)
            .map(|(mime, _)| *mime)
            .unwrap_or("application/octet-stream"),
        None => "application/octet-stream",
    }
}

/// Destination for a downloaded attachment: `<id>_<name>` when the sender
/// supplied a name, else `<id>_<unix time>.<ext>`, inside the folder for its type.
pub fn download_path(
    paths: &MediaPaths,
    message_id: &str,
    mime_type: &str,
    file_name: Option<&str>,
) -> PathBuf {
    let dir = paths.for_mime(mime_type);
    let name = match file_name.map(sanitize).filter(|n| !n.is_empty()) {
        Some(name) => format!("{message_id}_{name}"),
        None => format!(
            "{message_id}_{}.{}",
            Utc::now().timestamp(),
            extension_for(mime_type)
        ),
    };
    dir.join(name)
}

/// Keep only the final path component so a sender cannot pick the directory.
fn sanitize(name: &str) -> String {
    Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extensions_and_mime_types() {
        assert_eq!(extension_for("image/jpeg"), "jpg");
        assert_eq!(extension_for("audio/ogg; codecs=opus"), "ogg");
        assert_eq!(extension_for("application/x-unknown"), "bin");
        assert_eq!(mime_for(Path::new("/tmp/Photo.JPEG")), "image/jpeg");
        assert_eq!(mime_for(Path::new("report.pdf")), "application/pdf");
        assert_eq!(mime_for(Path::new("noext")), "application/octet-stream");
    }

    #[test]
    fn download_names_stay_inside_media_folder() {
        let paths = MediaPaths::under(Path::new("/srv/media"));
        let named = download_path(&paths, "ABC", "application/pdf", Some("../../etc/passwd"));
        assert_eq!(named, paths.documents.join("ABC_passwd"));

        let unnamed = download_path(&paths, "ABC", "image/png", None);
        assert!(unnamed.starts_with(&paths.pictures));
        assert!(unnamed.to_string_lossy().ends_with(".png"));
    }
}
