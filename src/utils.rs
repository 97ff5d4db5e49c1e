use std::path::{Path, PathBuf};

use url::Url;

pub fn get_filename_from_url(url: &Url) -> String {
    if let Some(segments) = url.path_segments() {
        if let Some(filename) = segments.last() {
            if !filename.is_empty() {
                let decoded = percent_encoding::percent_decode_str(filename).decode_utf8_lossy();
                return decoded.into_owned();
            }
        }
    }

    // Fallback if no filename found in path
    format!("download_{}", uuid::Uuid::new_v4())
}

pub fn sanitize_filename(filename: &str) -> String {
    filename.replace(|c: char| !c.is_alphanumeric() && c != '.' && c != '-' && c != '_', "_")
}

/// Picks the file the download is written to.
///
/// An explicit path naming a file is used as is. An explicit existing directory (or no
/// path at all) gets a derived name: the server's suggested filename, else the last URL
/// segment.
pub fn resolve_output_path(explicit: Option<&Path>, header_filename: Option<&str>, url: &Url) -> PathBuf {
    let dir = match explicit {
        Some(path) if path.is_dir() => Some(path),
        Some(path) => return path.to_path_buf(),
        None => None,
    };

    let filename = match header_filename {
        Some(name) => name.to_string(),
        None => get_filename_from_url(url),
    };
    let filename = sanitize_filename(&filename);

    match dir {
        Some(dir) => dir.join(filename),
        None => PathBuf::from(filename),
    }
}
