//! Lookup of prerecorded `.ogg` resources in the audio directory.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AudioError {
    #[error("audio directory {path:?} unreadable: {source}")]
    Directory { path: PathBuf, source: io::Error },
    #[error("no audio named {0:?}")]
    NotFound(String),
}

fn is_ogg(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("ogg"))
}

/// Names of the `.ogg` files in `dir` that start with `prefix`, sorted.
pub fn audio_files(dir: &Path, prefix: &str) -> Result<Vec<String>, AudioError> {
    let entries = std::fs::read_dir(dir).map_err(|source| AudioError::Directory {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| AudioError::Directory {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if !path.is_file() || !is_ogg(&path) {
            continue;
        }
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        if name.starts_with(prefix) {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(names)
}

/// Resolves `name` inside `dir`, appending `.ogg` when it has no extension.
pub fn find_audio(dir: &Path, name: &str) -> Result<PathBuf, AudioError> {
    let trimmed = name.trim();
    if trimmed.is_empty() || trimmed.contains(['/', '\\']) {
        return Err(AudioError::NotFound(name.to_string()));
    }
    let mut candidate = dir.join(trimmed);
    if candidate.extension().is_none() {
        candidate.set_extension("ogg");
    }
    if candidate.is_file() && is_ogg(&candidate) {
        Ok(candidate)
    } else {
        Err(AudioError::NotFound(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn library() -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("tempdir");
        for name in ["ncc8-2.ogg", "ncc8-1.ogg", "ncc8-notes.txt", "news.ogg", "NCC9.OGG"] {
            fs::write(dir.path().join(name), b"OggS").expect("write");
        }
        fs::create_dir(dir.path().join("ncc8-dir.ogg")).expect("mkdir");
        dir
    }

    #[test]
    fn prefix_listing_is_sorted_and_ogg_only() {
        let dir = library();
        let files = audio_files(dir.path(), "ncc8").expect("listing");
        assert_eq!(files, vec!["ncc8-1.ogg", "ncc8-2.ogg"]);
    }

    #[test]
    fn empty_prefix_lists_everything() {
        let dir = library();
        let files = audio_files(dir.path(), "").expect("listing");
        assert_eq!(files, vec!["NCC9.OGG", "ncc8-1.ogg", "ncc8-2.ogg", "news.ogg"]);
    }

    #[test]
    fn missing_directory_is_reported() {
        let dir = library();
        let err = audio_files(&dir.path().join("absent"), "x").expect_err("no directory");
        assert!(matches!(err, AudioError::Directory { .. }));
    }

    #[test]
    fn find_appends_extension() {
        let dir = library();
        assert_eq!(
            find_audio(dir.path(), "news").expect("found"),
            dir.path().join("news.ogg")
        );
        assert_eq!(
            find_audio(dir.path(), "ncc8-1.ogg").expect("found"),
            dir.path().join("ncc8-1.ogg")
        );
    }

    #[test]
    fn find_rejects_unknown_and_escaping_names() {
        let dir = library();
        assert!(matches!(find_audio(dir.path(), "weather"), Err(AudioError::NotFound(_))));
        assert!(matches!(find_audio(dir.path(), "../news"), Err(AudioError::NotFound(_))));
        assert!(matches!(find_audio(dir.path(), "ncc8-notes.txt"), Err(AudioError::NotFound(_))));
        assert!(matches!(find_audio(dir.path(), "  "), Err(AudioError::NotFound(_))));
    }
}
