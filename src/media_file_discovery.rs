//! Collects playable files from paths the host was asked to load.

use std::path::{Path, PathBuf};

use log::debug;

pub const SUPPORTED_AUDIO_EXTENSIONS: [&str; 7] =
    ["mp3", "wav", "ogg", "flac", "aac", "m4a", "mp4"];

pub fn is_supported_audio_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            SUPPORTED_AUDIO_EXTENSIONS
                .iter()
                .any(|supported| ext.eq_ignore_ascii_case(supported))
        })
        .unwrap_or(false)
}

/// Expands a mix of files and folders into the playable files they
/// contain. Folders are walked recursively; their contents come back
/// sorted so load order is stable across runs. Unreadable entries are
/// logged and skipped.
pub fn collect_audio_files(paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut collected = Vec::new();
    for path in paths {
        if path.is_dir() {
            let mut from_folder = collect_from_folder(path);
            from_folder.sort_unstable();
            collected.append(&mut from_folder);
        } else if is_supported_audio_file(path) {
            collected.push(path.clone());
        } else {
            debug!("Skipping unsupported file {}", path.display());
        }
    }
    collected
}

fn collect_from_folder(folder: &Path) -> Vec<PathBuf> {
    let mut pending = vec![folder.to_path_buf()];
    let mut files = Vec::new();
    while let Some(directory) = pending.pop() {
        let entries = match std::fs::read_dir(&directory) {
            Ok(entries) => entries,
            Err(err) => {
                debug!("Failed to read directory {}: {}", directory.display(), err);
                continue;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
            } else if is_supported_audio_file(&path) {
                files.push(path);
            }
        }
    }
    files
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_match_is_case_insensitive() {
        assert!(is_supported_audio_file(Path::new("/m/track.MP3")));
        assert!(is_supported_audio_file(Path::new("/m/track.flac")));
        assert!(!is_supported_audio_file(Path::new("/m/notes.txt")));
        assert!(!is_supported_audio_file(Path::new("/m/no_extension")));
    }

    #[test]
    fn plain_files_pass_through_in_input_order() {
        let paths = vec![
            PathBuf::from("/m/b.mp3"),
            PathBuf::from("/m/a.ogg"),
            PathBuf::from("/m/skip.txt"),
        ];
        assert_eq!(
            collect_audio_files(&paths),
            vec![PathBuf::from("/m/b.mp3"), PathBuf::from("/m/a.ogg")]
        );
    }
}
