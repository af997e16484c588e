use std::cmp::Ordering;
use std::fmt;
use std::path::{Path, PathBuf};

/// Tag metadata extracted by the media layer on first play.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackMetadata {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub genre: Option<String>,
    pub year: Option<String>,
}

/// One loaded media item. Identity is the extracted file name, which is
/// unique within the loaded set; the path is the playable handle and the
/// dedup key when loading.
#[derive(Debug, Clone)]
pub struct Track {
    file_name: String,
    path: PathBuf,
    metadata: Option<TrackMetadata>,
}

impl Track {
    pub fn from_path(path: &Path) -> Track {
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| path.to_string_lossy().to_string());
        Track {
            file_name,
            path: path.to_path_buf(),
            metadata: None,
        }
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn metadata(&self) -> Option<&TrackMetadata> {
        self.metadata.as_ref()
    }

    pub fn has_metadata(&self) -> bool {
        self.metadata.is_some()
    }

    pub fn set_metadata(&mut self, metadata: TrackMetadata) {
        self.metadata = Some(metadata);
    }

    /// Dedup key for the loaded set. Canonicalization collapses distinct
    /// spellings of the same file; files that cannot be resolved (not yet
    /// on disk, permission errors) fall back to the path as given.
    pub fn dedup_key(path: &Path) -> PathBuf {
        std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
    }
}

impl fmt::Display for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.file_name)
    }
}

impl PartialEq for Track {
    fn eq(&self, other: &Self) -> bool {
        self.file_name == other.file_name
    }
}

impl Eq for Track {}

impl PartialOrd for Track {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Track {
    fn cmp(&self, other: &Self) -> Ordering {
        self.file_name.cmp(&other.file_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn track_identity_is_the_file_name() {
        let a = Track::from_path(&PathBuf::from("/music/party/song.mp3"));
        let b = Track::from_path(&PathBuf::from("/other/place/song.mp3"));
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "song.mp3");
    }

    #[test]
    fn tracks_order_by_file_name() {
        let mut tracks = vec![
            Track::from_path(&PathBuf::from("/m/b.mp3")),
            Track::from_path(&PathBuf::from("/m/a.mp3")),
        ];
        tracks.sort();
        assert_eq!(tracks[0].file_name(), "a.mp3");
    }

    #[test]
    fn dedup_key_falls_back_for_missing_files() {
        let path = PathBuf::from("/definitely/not/on/disk.mp3");
        assert_eq!(Track::dedup_key(&path), path);
    }

    #[test]
    fn metadata_starts_unset() {
        let mut track = Track::from_path(&PathBuf::from("/m/a.mp3"));
        assert!(!track.has_metadata());
        track.set_metadata(TrackMetadata {
            title: Some("A".to_string()),
            ..TrackMetadata::default()
        });
        assert!(track.has_metadata());
    }
}
