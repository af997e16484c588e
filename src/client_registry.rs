//! Registry of connected clients' outbound sinks.

use std::collections::HashMap;
use std::io::{self, BufWriter, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::Mutex;

use log::{debug, info, warn};

use crate::protocol::ServerFrame;

/// Outbound half of one client connection. The TCP-backed sink and the
/// test doubles share this surface.
pub trait ClientSink: Send {
    /// Writes one full frame group and flushes it.
    fn send_frame(&mut self, frame: &ServerFrame) -> io::Result<()>;

    /// Releases the underlying connection. Closing also unblocks the
    /// owning worker's read loop, which then tears the connection down.
    fn close(&mut self);
}

/// [`ClientSink`] writing to a connected socket.
pub struct TcpClientSink {
    writer: BufWriter<TcpStream>,
    stream: TcpStream,
}

impl TcpClientSink {
    pub fn new(stream: TcpStream) -> io::Result<TcpClientSink> {
        let writer = BufWriter::new(stream.try_clone()?);
        Ok(TcpClientSink { writer, stream })
    }
}

impl ClientSink for TcpClientSink {
    fn send_frame(&mut self, frame: &ServerFrame) -> io::Result<()> {
        for line in frame.to_lines() {
            self.writer.write_all(line.as_bytes())?;
            self.writer.write_all(b"\n")?;
        }
        self.writer.flush()
    }

    fn close(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// Map from requester id to the client's outbound sink. One mutex guards
/// the map and is held for the duration of delivery, so frame groups from
/// concurrent senders never interleave on a socket.
pub struct ClientRegistry {
    sinks: Mutex<HashMap<String, Box<dyn ClientSink>>>,
}

impl ClientRegistry {
    pub fn new() -> ClientRegistry {
        ClientRegistry {
            sinks: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a client's sink. A reconnect under the same id replaces
    /// the prior sink; the stale socket dies on its own error path.
    pub fn register(&self, id: &str, sink: Box<dyn ClientSink>) {
        let mut sinks = self.sinks.lock().expect("client registry lock poisoned");
        if sinks.insert(id.to_string(), sink).is_some() {
            info!("Client {} reconnected, replacing previous sink", id);
        } else {
            info!("Client {} registered", id);
        }
    }

    /// Removes a client's sink if present. Safe to call twice; worker
    /// teardown and broadcast failure paths may race to it.
    pub fn unregister(&self, id: &str) {
        let mut sinks = self.sinks.lock().expect("client registry lock poisoned");
        if sinks.remove(id).is_some() {
            info!("Client {} unregistered", id);
        } else {
            debug!("Client {} already unregistered", id);
        }
    }

    /// Delivers `frame` to every registered client. A write failure on one
    /// sink never aborts delivery to the others; each failed sink is
    /// closed and dropped from the registry. Returns the number of clients
    /// the frame was delivered to.
    pub fn broadcast(&self, frame: &ServerFrame) -> usize {
        let mut sinks = self.sinks.lock().expect("client registry lock poisoned");
        let mut failed_ids = Vec::new();
        let mut delivered = 0;
        for (id, sink) in sinks.iter_mut() {
            match sink.send_frame(frame) {
                Ok(()) => delivered += 1,
                Err(err) => {
                    warn!("Failed to send {} to client {}: {}", frame.code(), id, err);
                    failed_ids.push(id.clone());
                }
            }
        }
        for id in failed_ids {
            if let Some(mut sink) = sinks.remove(&id) {
                sink.close();
                info!("Client {} dropped after write failure", id);
            }
        }
        delivered
    }

    /// Delivers `frame` to one client only. Returns false when the client
    /// is unknown or the write failed; a failed sink is closed and dropped.
    pub fn send_to(&self, id: &str, frame: &ServerFrame) -> bool {
        let mut sinks = self.sinks.lock().expect("client registry lock poisoned");
        let Some(sink) = sinks.get_mut(id) else {
            debug!("No sink registered for client {}", id);
            return false;
        };
        match sink.send_frame(frame) {
            Ok(()) => true,
            Err(err) => {
                warn!("Failed to send {} to client {}: {}", frame.code(), id, err);
                if let Some(mut sink) = sinks.remove(id) {
                    sink.close();
                }
                false
            }
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sinks
            .lock()
            .expect("client registry lock poisoned")
            .contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.sinks
            .lock()
            .expect("client registry lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        ClientRegistry::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Records delivered frames; optionally fails every write.
    struct RecordingSink {
        frames: Arc<Mutex<Vec<ServerFrame>>>,
        fail_writes: bool,
        closed: Arc<Mutex<bool>>,
    }

    impl RecordingSink {
        fn new() -> (RecordingSink, Arc<Mutex<Vec<ServerFrame>>>, Arc<Mutex<bool>>) {
            let frames = Arc::new(Mutex::new(Vec::new()));
            let closed = Arc::new(Mutex::new(false));
            let sink = RecordingSink {
                frames: frames.clone(),
                fail_writes: false,
                closed: closed.clone(),
            };
            (sink, frames, closed)
        }

        fn failing() -> (RecordingSink, Arc<Mutex<bool>>) {
            let closed = Arc::new(Mutex::new(false));
            let sink = RecordingSink {
                frames: Arc::new(Mutex::new(Vec::new())),
                fail_writes: true,
                closed: closed.clone(),
            };
            (sink, closed)
        }
    }

    impl ClientSink for RecordingSink {
        fn send_frame(&mut self, frame: &ServerFrame) -> io::Result<()> {
            if self.fail_writes {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "sink failed"));
            }
            self.frames.lock().unwrap().push(frame.clone());
            Ok(())
        }

        fn close(&mut self) {
            *self.closed.lock().unwrap() = true;
        }
    }

    #[test]
    fn unregister_is_idempotent() {
        let registry = ClientRegistry::new();
        let (sink, _, _) = RecordingSink::new();
        registry.register("phone-1", Box::new(sink));
        registry.unregister("phone-1");
        registry.unregister("phone-1");
        assert!(!registry.contains("phone-1"));
        assert!(registry.is_empty());
    }

    #[test]
    fn one_failing_sink_does_not_stop_the_broadcast() {
        let registry = ClientRegistry::new();
        let (good_a, frames_a, _) = RecordingSink::new();
        let (bad, bad_closed) = RecordingSink::failing();
        let (good_b, frames_b, _) = RecordingSink::new();
        registry.register("a", Box::new(good_a));
        registry.register("bad", Box::new(bad));
        registry.register("b", Box::new(good_b));

        let delivered = registry.broadcast(&ServerFrame::MoveUp);

        assert_eq!(delivered, 2);
        assert_eq!(frames_a.lock().unwrap().len(), 1);
        assert_eq!(frames_b.lock().unwrap().len(), 1);
        assert!(!registry.contains("bad"));
        assert!(*bad_closed.lock().unwrap());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn reconnect_replaces_the_prior_sink() {
        let registry = ClientRegistry::new();
        let (stale, stale_frames, _) = RecordingSink::new();
        let (fresh, fresh_frames, _) = RecordingSink::new();
        registry.register("phone-1", Box::new(stale));
        registry.register("phone-1", Box::new(fresh));
        assert_eq!(registry.len(), 1);

        registry.broadcast(&ServerFrame::MoveUp);
        assert!(stale_frames.lock().unwrap().is_empty());
        assert_eq!(fresh_frames.lock().unwrap().len(), 1);
    }

    #[test]
    fn send_to_unknown_client_is_a_miss_not_an_error() {
        let registry = ClientRegistry::new();
        assert!(!registry.send_to("ghost", &ServerFrame::MoveUp));
    }

    #[test]
    fn send_to_failure_drops_the_client() {
        let registry = ClientRegistry::new();
        let (bad, bad_closed) = RecordingSink::failing();
        registry.register("bad", Box::new(bad));
        assert!(!registry.send_to("bad", &ServerFrame::MoveUp));
        assert!(!registry.contains("bad"));
        assert!(*bad_closed.lock().unwrap());
    }
}
