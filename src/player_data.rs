//! Shared playback-queue state machine.
//!
//! `PlayerData` owns the loaded-track list, the fair play queue, and the
//! playback cursor. It is held behind an `Arc<Mutex<..>>` by the host and
//! every connection worker; all mutations pass through the lock, and bus
//! notifications are sent while the lock is held, so subscribers always
//! observe `MoveUp` before `NowPlaying` for one advance and never a
//! half-applied mutation.

use std::collections::HashSet;
use std::path::PathBuf;

use log::{debug, error, info};
use rand::{rngs::StdRng, RngExt, SeedableRng};
use tokio::sync::broadcast::Sender;

use crate::protocol::{GuiNotification, Message, NetworkNotification};
use crate::track::{Track, TrackMetadata};

/// One pending request: who asked, and for what.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub requester_id: String,
    pub track: Track,
}

/// Consistent view of the model used for a new connection's initial push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub song_list: Vec<String>,
    pub queue_list: Vec<(String, String)>,
    pub now_playing: Option<String>,
}

pub struct PlayerData {
    loaded_tracks: Vec<Track>,
    loaded_keys: HashSet<PathBuf>,
    queue: Vec<QueueEntry>,
    current_index: Option<usize>,
    random_order: bool,
    /// Requester whose queued track was most recently promoted to
    /// now-playing, if the current track came off the queue.
    last_dequeued_requester: Option<String>,
    rng: StdRng,
    bus: Sender<Message>,
}

impl PlayerData {
    pub fn new(bus: Sender<Message>, random_order: bool) -> PlayerData {
        let mut seed = [0u8; 32];
        getrandom::fill(&mut seed).expect("Failed to generate random seed");
        PlayerData {
            loaded_tracks: Vec::new(),
            loaded_keys: HashSet::new(),
            queue: Vec::new(),
            current_index: None,
            random_order,
            last_dequeued_requester: None,
            rng: StdRng::from_seed(seed),
            bus,
        }
    }

    pub fn set_random_order(&mut self, random_order: bool) {
        self.random_order = random_order;
    }

    pub fn random_order(&self) -> bool {
        self.random_order
    }

    pub fn loaded_tracks(&self) -> &[Track] {
        &self.loaded_tracks
    }

    pub fn current_index(&self) -> Option<usize> {
        self.current_index
    }

    pub fn current_track(&self) -> Option<&Track> {
        self.current_index.map(|index| &self.loaded_tracks[index])
    }

    /// Head of the play queue, previewed as "up next" by the host UI.
    pub fn next_in_queue(&self) -> Option<&Track> {
        self.queue.first().map(|entry| &entry.track)
    }

    pub fn queue_entries(&self) -> &[QueueEntry] {
        &self.queue
    }

    pub fn last_dequeued_requester(&self) -> Option<&str> {
        self.last_dequeued_requester.as_deref()
    }

    /// Queue contents as (track, requester) pairs in play order, the shape
    /// the wire frame wants.
    pub fn queue_list(&self) -> Vec<(String, String)> {
        self.queue
            .iter()
            .map(|entry| {
                (
                    entry.track.file_name().to_string(),
                    entry.requester_id.clone(),
                )
            })
            .collect()
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            song_list: self
                .loaded_tracks
                .iter()
                .map(|track| track.file_name().to_string())
                .collect(),
            queue_list: self.queue_list(),
            now_playing: self
                .current_track()
                .map(|track| track.file_name().to_string()),
        }
    }

    /// Loads `paths` that are not already present (by canonical file path),
    /// preserving input order, and returns exactly the newly added tracks.
    /// Starts playback when nothing has ever played and the load accepted
    /// at least one track.
    pub fn add_tracks(&mut self, paths: &[PathBuf]) -> Vec<Track> {
        let mut added = Vec::new();
        for path in paths {
            let key = Track::dedup_key(path);
            if self.loaded_keys.contains(&key) {
                debug!("Skipping already loaded file {}", path.display());
                continue;
            }
            self.loaded_keys.insert(key);
            added.push(Track::from_path(path));
        }
        if added.is_empty() {
            return added;
        }

        self.loaded_tracks.extend(added.iter().cloned());
        info!(
            "Loaded {} new tracks ({} total)",
            added.len(),
            self.loaded_tracks.len()
        );
        self.send_network(NetworkNotification::SongPartialList(
            added.iter().map(|track| track.file_name().to_string()).collect(),
        ));
        self.send_gui(GuiNotification::SongsAdded(added.len()));
        if self.current_index.is_none() {
            self.advance();
        }
        added
    }

    /// Enqueues the named loaded track for `requester_id` under the
    /// fairness rule: a requester with no pending entry is appended to the
    /// tail and the result is the new 1-based queue length; a requester
    /// that already has an entry gets its track replaced in place and the
    /// result is that entry's 0-based position. A name that matches no
    /// loaded track is rejected with no state change.
    pub fn enqueue(&mut self, requester_id: &str, track_name: &str) -> Option<usize> {
        let Some(track) = self.find_loaded(track_name).cloned() else {
            debug!(
                "Rejecting enqueue from {}: no loaded track named {}",
                requester_id, track_name
            );
            return None;
        };

        let result = match self
            .queue
            .iter()
            .position(|entry| entry.requester_id == requester_id)
        {
            Some(position) => {
                self.queue[position].track = track.clone();
                position
            }
            None => {
                self.queue.push(QueueEntry {
                    requester_id: requester_id.to_string(),
                    track: track.clone(),
                });
                self.queue.len()
            }
        };
        info!(
            "Enqueued {} for {} (result {})",
            track.file_name(),
            requester_id,
            result
        );
        self.send_network(NetworkNotification::Enqueued {
            track: track.file_name().to_string(),
            requester: requester_id.to_string(),
            result,
        });
        self.send_gui(GuiNotification::QueueChanged);
        Some(result)
    }

    /// Moves to the next track: the queue head when the queue is
    /// non-empty (FIFO), otherwise the next loaded track under the active
    /// playback order. Called on manual skip and by the media layer's
    /// completion callback via [`PlayerData::track_ended`].
    pub fn advance(&mut self) {
        if self.queue.is_empty() {
            self.last_dequeued_requester = None;
            if !self.select_next_loaded(Direction::Forward) {
                return;
            }
        } else {
            let entry = self.queue.remove(0);
            self.last_dequeued_requester = Some(entry.requester_id.clone());
            self.send_network(NetworkNotification::MoveUp);
            self.set_current_by_track(&entry.track);
        }
        self.announce_now_playing();
    }

    /// Moves to the previous loaded track. The queue is never consulted
    /// going backward; random order draws a fresh no-repeat index.
    pub fn previous(&mut self) {
        self.last_dequeued_requester = None;
        if !self.select_next_loaded(Direction::Backward) {
            return;
        }
        self.announce_now_playing();
    }

    /// Direct jump to the named loaded track, bypassing both the queue and
    /// the sequential/random selection. Returns false for unknown names.
    pub fn play_on_click(&mut self, track_name: &str) -> bool {
        let Some(index) = self
            .loaded_tracks
            .iter()
            .position(|track| track.file_name() == track_name)
        else {
            debug!("Click on unknown track {}", track_name);
            return false;
        };
        self.last_dequeued_requester = None;
        self.current_index = Some(index);
        self.announce_now_playing();
        true
    }

    /// Completion callback from the media layer.
    pub fn track_ended(&mut self) {
        self.advance();
    }

    /// Stores tag metadata extracted by the media layer on first play.
    pub fn attach_metadata(&mut self, track_name: &str, metadata: TrackMetadata) -> bool {
        match self
            .loaded_tracks
            .iter_mut()
            .find(|track| track.file_name() == track_name)
        {
            Some(track) => {
                track.set_metadata(metadata);
                true
            }
            None => false,
        }
    }

    fn find_loaded(&self, track_name: &str) -> Option<&Track> {
        self.loaded_tracks
            .iter()
            .find(|track| track.file_name() == track_name)
    }

    fn set_current_by_track(&mut self, track: &Track) {
        match self.loaded_tracks.iter().position(|loaded| loaded == track) {
            Some(index) => self.current_index = Some(index),
            // Queue entries are clones of loaded tracks, so this only
            // fires if that invariant is broken elsewhere.
            None => error!(
                "Queued track {} is not in the loaded list",
                track.file_name()
            ),
        }
    }

    /// Picks the next cursor position from the loaded list. Returns false
    /// when there is nothing to play.
    fn select_next_loaded(&mut self, direction: Direction) -> bool {
        let len = self.loaded_tracks.len();
        if len == 0 {
            debug!("Nothing loaded, staying idle");
            return false;
        }
        let next_index = if self.random_order {
            self.random_index(len)
        } else {
            match (direction, self.current_index) {
                (Direction::Forward, Some(index)) => (index + 1) % len,
                (Direction::Forward, None) => 0,
                (Direction::Backward, Some(0)) | (Direction::Backward, None) => len - 1,
                (Direction::Backward, Some(index)) => index - 1,
            }
        };
        self.current_index = Some(next_index);
        true
    }

    /// Uniform draw that differs from the current index. The length check
    /// happens before the loop: with a single loaded track the draw is
    /// defined as replaying it, never a spin.
    fn random_index(&mut self, len: usize) -> usize {
        if len < 2 {
            return 0;
        }
        loop {
            let candidate = self.rng.random_range(0..len);
            if Some(candidate) != self.current_index {
                return candidate;
            }
        }
    }

    fn announce_now_playing(&mut self) {
        let Some(track) = self.current_track().cloned() else {
            return;
        };
        self.send_network(NetworkNotification::NowPlaying(
            track.file_name().to_string(),
        ));
        self.send_gui(GuiNotification::PlaybackChanged {
            current_index: self.current_index,
            current_track: Some(track),
            next_in_queue: self.next_in_queue().cloned(),
        });
    }

    fn send_network(&self, notification: NetworkNotification) {
        let _ = self.bus.send(Message::Network(notification));
    }

    fn send_gui(&self, notification: GuiNotification) {
        let _ = self.bus.send(Message::Gui(notification));
    }
}

#[derive(Clone, Copy)]
enum Direction {
    Forward,
    Backward,
}
