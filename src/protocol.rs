//! Wire protocol and event-bus payloads shared by the model and the
//! broadcast server.
//!
//! The wire format is UTF-8 text over TCP, one field per `\n`-terminated
//! line, no length prefixes. A frame group is a code line, the fixed
//! payload schema for that code, and the [`SENTINEL`] line. Decoding is
//! caller-driven: the reader pulls exactly as many lines as the schema for
//! a code requires, so a peer that sends a short or wrong schema
//! desynchronizes the stream and surfaces as an IO error on a later read.

use std::io::{self, BufRead};

use crate::track::Track;

/// Terminator line closing every server frame group.
pub const SENTINEL: &str = "SERVER_BROADCAST_ENDED";

pub const SERVER_SONG_LIST: &str = "SERVER_SONG_LIST";
pub const SERVER_SONG_PARTIAL_LIST: &str = "SERVER_SONG_PARTIAL_LIST";
pub const SERVER_QUEUE_LIST: &str = "SERVER_QUEUE_LIST";
pub const SERVER_NOW_PLAYING: &str = "SERVER_NOW_PLAYING";
pub const SERVER_MOVE_UP: &str = "SERVER_MOVE_UP";
pub const SERVER_ENQUEUED: &str = "SERVER_ENQUEUED";

pub const CLIENT_QUEUE: &str = "CLIENT_QUEUE";
pub const CLIENT_SONG_REQUEST: &str = "CLIENT_SONG_REQUEST";
pub const CLIENT_QUEUE_REQUEST: &str = "CLIENT_QUEUE_REQUEST";
pub const CLIENT_NOW_PLAYING_REQUEST: &str = "CLIENT_NOW_PLAYING_REQUEST";

/// One server-originated frame group, ready to encode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerFrame {
    /// Full loaded-track list, one track line each.
    SongList(Vec<String>),
    /// Tracks added by the most recent load, one track line each.
    SongPartialList(Vec<String>),
    /// Queue entries in play order as (track, requester) line pairs.
    QueueList(Vec<(String, String)>),
    /// The track that just started playing.
    NowPlaying(String),
    /// Instructs clients to shift their cached queue view up by one.
    MoveUp,
    /// Outcome of an enqueue request: the track, who asked, and the
    /// resulting position (1-based tail length for a new entry, 0-based
    /// position for an in-place replacement).
    Enqueued {
        track: String,
        requester: String,
        result: usize,
    },
}

impl ServerFrame {
    pub fn code(&self) -> &'static str {
        match self {
            ServerFrame::SongList(_) => SERVER_SONG_LIST,
            ServerFrame::SongPartialList(_) => SERVER_SONG_PARTIAL_LIST,
            ServerFrame::QueueList(_) => SERVER_QUEUE_LIST,
            ServerFrame::NowPlaying(_) => SERVER_NOW_PLAYING,
            ServerFrame::MoveUp => SERVER_MOVE_UP,
            ServerFrame::Enqueued { .. } => SERVER_ENQUEUED,
        }
    }

    /// Encodes this frame as its full line sequence: code line, payload
    /// schema, sentinel line.
    pub fn to_lines(&self) -> Vec<String> {
        let mut lines = vec![self.code().to_string()];
        match self {
            ServerFrame::SongList(tracks) | ServerFrame::SongPartialList(tracks) => {
                lines.extend(tracks.iter().cloned());
            }
            ServerFrame::QueueList(entries) => {
                for (track, requester) in entries {
                    lines.push(track.clone());
                    lines.push(requester.clone());
                }
            }
            ServerFrame::NowPlaying(track) => lines.push(track.clone()),
            ServerFrame::MoveUp => {}
            ServerFrame::Enqueued {
                track,
                requester,
                result,
            } => {
                lines.push(track.clone());
                lines.push(requester.clone());
                lines.push(result.to_string());
            }
        }
        lines.push(SENTINEL.to_string());
        lines
    }
}

/// One client-originated request, parsed off the connection's read loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientRequest {
    /// Ask the host to enqueue a loaded track for the given requester.
    Queue { requester: String, track: String },
    /// Ask for a re-send of the full song list, to this client only.
    SongRequest,
    /// Ask for a re-send of the queue list, to this client only.
    QueueRequest,
    /// Ask for a re-send of the now-playing track, to this client only.
    NowPlayingRequest,
}

impl ClientRequest {
    /// Resolves a code line to a request, pulling the code's fixed payload
    /// schema from `reader`. Returns `Ok(None)` for codes this server does
    /// not recognize; the read loop skips those lines.
    pub fn read(code: &str, reader: &mut impl BufRead) -> io::Result<Option<ClientRequest>> {
        match code {
            CLIENT_QUEUE => {
                let requester = read_schema_line(reader)?;
                let track = read_schema_line(reader)?;
                Ok(Some(ClientRequest::Queue { requester, track }))
            }
            CLIENT_SONG_REQUEST => Ok(Some(ClientRequest::SongRequest)),
            CLIENT_QUEUE_REQUEST => Ok(Some(ClientRequest::QueueRequest)),
            CLIENT_NOW_PLAYING_REQUEST => Ok(Some(ClientRequest::NowPlayingRequest)),
            _ => Ok(None),
        }
    }
}

/// Reads one schema line, treating end-of-stream mid-frame as an error.
pub fn read_schema_line(reader: &mut impl BufRead) -> io::Result<String> {
    match read_line(reader)? {
        Some(line) => Ok(line),
        None => Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "stream ended inside a frame payload",
        )),
    }
}

/// Reads one protocol line, stripping the `\n` (and a `\r` from clients
/// that send CRLF). Returns `None` at end-of-stream.
pub fn read_line(reader: &mut impl BufRead) -> io::Result<Option<String>> {
    let mut line = String::new();
    let bytes_read = reader.read_line(&mut line)?;
    if bytes_read == 0 {
        return Ok(None);
    }
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    Ok(Some(line))
}

/// Top-level envelope for all bus traffic.
#[derive(Debug, Clone)]
pub enum Message {
    Network(NetworkNotification),
    Gui(GuiNotification),
}

/// Network-facing change notifications. Each variant carries the payload
/// snapshot taken while the model lock was held, so every subscriber
/// observes state consistent with the mutation that produced it.
#[derive(Debug, Clone)]
pub enum NetworkNotification {
    SongPartialList(Vec<String>),
    NowPlaying(String),
    MoveUp,
    Enqueued {
        track: String,
        requester: String,
        result: usize,
    },
}

impl NetworkNotification {
    pub fn to_frame(&self) -> ServerFrame {
        match self {
            NetworkNotification::SongPartialList(tracks) => {
                ServerFrame::SongPartialList(tracks.clone())
            }
            NetworkNotification::NowPlaying(track) => ServerFrame::NowPlaying(track.clone()),
            NetworkNotification::MoveUp => ServerFrame::MoveUp,
            NetworkNotification::Enqueued {
                track,
                requester,
                result,
            } => ServerFrame::Enqueued {
                track: track.clone(),
                requester: requester.clone(),
                result: *result,
            },
        }
    }
}

/// GUI-facing change notifications, kept distinct from the network channel.
#[derive(Debug, Clone)]
pub enum GuiNotification {
    /// Cursor moved: what is playing now and what is previewed next.
    PlaybackChanged {
        current_index: Option<usize>,
        current_track: Option<Track>,
        next_in_queue: Option<Track>,
    },
    /// Queue contents changed without the cursor moving.
    QueueChanged,
    /// A load accepted this many new tracks.
    SongsAdded(usize),
    /// The broadcast server came up at this address.
    ServerStarted(String),
}
