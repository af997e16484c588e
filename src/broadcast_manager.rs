//! TCP broadcast server: accept loop, connection worker pool, and the
//! bus-to-socket forwarder.
//!
//! One thread accepts connections and hands them to a fixed pool of
//! worker threads over an mpsc channel; excess connections wait in the
//! channel for a free worker. A separate forwarder thread turns
//! network-facing bus notifications into wire frames and delivers them
//! through the [`ClientRegistry`]. Workers block on line reads; a
//! connection failure tears down only that connection.

use std::io::{self, BufReader};
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::Sender;

use crate::client_registry::{ClientRegistry, TcpClientSink};
use crate::config::NetworkConfig;
use crate::player_data::PlayerData;
use crate::protocol::{self, ClientRequest, GuiNotification, Message, ServerFrame};

const ACCEPT_POLL_SLEEP: Duration = Duration::from_millis(25);

pub struct BroadcastManager {
    config: NetworkConfig,
    player: Arc<Mutex<PlayerData>>,
    registry: Arc<ClientRegistry>,
    bus: Sender<Message>,
    running: Arc<AtomicBool>,
    forwarder_started: AtomicBool,
    server_address: Mutex<Option<SocketAddr>>,
    accept_handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl BroadcastManager {
    pub fn new(
        config: NetworkConfig,
        player: Arc<Mutex<PlayerData>>,
        registry: Arc<ClientRegistry>,
        bus: Sender<Message>,
    ) -> BroadcastManager {
        BroadcastManager {
            config,
            player,
            registry,
            bus,
            running: Arc::new(AtomicBool::new(false)),
            forwarder_started: AtomicBool::new(false),
            server_address: Mutex::new(None),
            accept_handle: Mutex::new(None),
        }
    }

    /// Address the server is (or was last) bound to.
    pub fn server_address(&self) -> Option<SocketAddr> {
        *self
            .server_address
            .lock()
            .expect("server address lock poisoned")
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Binds and starts accepting. Idempotent: a second call while running
    /// warns and succeeds without doing anything. Bind and
    /// address-discovery failures are fatal to this call and leave the
    /// server stopped.
    pub fn start(&self) -> Result<(), String> {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!(
                "Broadcast server is already running at {:?}",
                self.server_address()
            );
            return Ok(());
        }

        let bind_ip = match self.resolve_bind_address() {
            Ok(ip) => ip,
            Err(err) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(err);
            }
        };
        let listener = match bind_listener(bind_ip, self.config.port) {
            Ok(listener) => listener,
            Err(err) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(err);
            }
        };
        let local_addr = match listener.local_addr() {
            Ok(local_addr) => local_addr,
            Err(err) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(format!("failed to read server address: {err}"));
            }
        };
        *self
            .server_address
            .lock()
            .expect("server address lock poisoned") = Some(local_addr);
        info!("Broadcast server listening at {}", local_addr);
        let _ = self
            .bus
            .send(Message::Gui(GuiNotification::ServerStarted(
                local_addr.to_string(),
            )));

        // The forwarder outlives stop(); spawn it once so a restart does
        // not leave a second subscriber double-delivering every broadcast.
        if !self.forwarder_started.swap(true, Ordering::SeqCst) {
            self.spawn_forwarder();
        }
        let socket_sender = self.spawn_worker_pool();
        let accept_handle = self.spawn_accept_loop(listener, socket_sender);
        *self
            .accept_handle
            .lock()
            .expect("accept handle lock poisoned") = Some(accept_handle);
        Ok(())
    }

    /// Stops accepting new connections and drains the worker pool. Live
    /// per-client sockets are not force-closed; their workers finish when
    /// the client disconnects.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            debug!("Broadcast server already stopped");
            return;
        }
        let handle = self
            .accept_handle
            .lock()
            .expect("accept handle lock poisoned")
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("Accept loop thread panicked");
            }
        }
        info!("Broadcast server stopped");
    }

    fn resolve_bind_address(&self) -> Result<IpAddr, String> {
        if self.config.bind_address.is_empty() {
            return discover_private_address();
        }
        self.config
            .bind_address
            .parse::<IpAddr>()
            .map_err(|err| {
                format!(
                    "invalid bind address {:?}: {err}",
                    self.config.bind_address
                )
            })
    }

    /// Spawned on the first `start()` only; the thread lives until the
    /// bus closes at process shutdown.
    fn spawn_forwarder(&self) {
        let mut receiver = self.bus.subscribe();
        let registry = Arc::clone(&self.registry);
        thread::spawn(move || loop {
            match receiver.blocking_recv() {
                Ok(Message::Network(notification)) => {
                    let frame = notification.to_frame();
                    let delivered = registry.broadcast(&frame);
                    debug!("Broadcast {} to {} clients", frame.code(), delivered);
                }
                Ok(Message::Gui(_)) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Broadcast forwarder lagged, skipped {} messages", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        });
    }

    fn spawn_worker_pool(&self) -> mpsc::Sender<TcpStream> {
        let (socket_sender, socket_receiver) = mpsc::channel::<TcpStream>();
        let socket_receiver = Arc::new(Mutex::new(socket_receiver));
        let pool_size = self.config.worker_threads.max(1);
        for worker_index in 0..pool_size {
            let socket_receiver = Arc::clone(&socket_receiver);
            let player = Arc::clone(&self.player);
            let registry = Arc::clone(&self.registry);
            thread::spawn(move || loop {
                let stream = {
                    let receiver = socket_receiver
                        .lock()
                        .expect("connection queue lock poisoned");
                    receiver.recv()
                };
                match stream {
                    Ok(stream) => serve_connection(stream, &player, &registry),
                    Err(_) => {
                        debug!("Connection worker {} draining, queue closed", worker_index);
                        break;
                    }
                }
            });
        }
        socket_sender
    }

    fn spawn_accept_loop(
        &self,
        listener: TcpListener,
        socket_sender: mpsc::Sender<TcpStream>,
    ) -> thread::JoinHandle<()> {
        let running = Arc::clone(&self.running);
        thread::spawn(move || {
            while running.load(Ordering::SeqCst) {
                match listener.accept() {
                    Ok((stream, peer)) => {
                        debug!("Accepted connection from {}", peer);
                        if let Err(err) = stream.set_nonblocking(false) {
                            warn!("Dropping connection from {}: {}", peer, err);
                            continue;
                        }
                        if socket_sender.send(stream).is_err() {
                            break;
                        }
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                        thread::sleep(ACCEPT_POLL_SLEEP);
                    }
                    Err(err) => {
                        error!("Accept failed, shutting the server down: {}", err);
                        running.store(false, Ordering::SeqCst);
                        break;
                    }
                }
            }
            // Dropping the listener closes the socket; dropping the sender
            // lets idle workers drain out.
        })
    }
}

fn bind_listener(ip: IpAddr, port: u16) -> Result<TcpListener, String> {
    let listener = TcpListener::bind(SocketAddr::new(ip, port))
        .map_err(|err| format!("failed to bind broadcast server at {}:{}: {err}", ip, port))?;
    listener
        .set_nonblocking(true)
        .map_err(|err| format!("failed to set broadcast server non-blocking: {err}"))?;
    Ok(listener)
}

/// Discovers the host's private-network address from its default route: a
/// UDP socket is bound and connected (no packets leave the host) and the
/// chosen local address is accepted only when it is in RFC1918 space.
fn discover_private_address() -> Result<IpAddr, String> {
    let socket = UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], 0)))
        .map_err(|err| format!("failed to bind address-discovery socket: {err}"))?;
    socket
        .connect(("8.8.8.8", 53))
        .map_err(|err| format!("failed to probe the default route: {err}"))?;
    let ip = socket
        .local_addr()
        .map_err(|err| format!("failed to read the discovered address: {err}"))?
        .ip();
    match ip {
        IpAddr::V4(v4) if v4.is_private() => Ok(ip),
        other => Err(format!(
            "discovered address {} is not a private-network address",
            other
        )),
    }
}

/// Serves one accepted connection: handshake, snapshot push, then the
/// blocking request loop until disconnect.
fn serve_connection(
    stream: TcpStream,
    player: &Arc<Mutex<PlayerData>>,
    registry: &Arc<ClientRegistry>,
) {
    let peer = stream
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "unknown peer".to_string());
    let reader_stream = match stream.try_clone() {
        Ok(reader_stream) => reader_stream,
        Err(err) => {
            warn!("Failed to clone socket for {}: {}", peer, err);
            return;
        }
    };
    let mut reader = BufReader::new(reader_stream);

    // Handshaking: a code line (unused) then the requester id.
    let requester_id = match read_handshake(&mut reader) {
        Ok(requester_id) => requester_id,
        Err(err) => {
            warn!("Handshake with {} failed: {}", peer, err);
            return;
        }
    };
    let sink = match TcpClientSink::new(stream) {
        Ok(sink) => sink,
        Err(err) => {
            warn!("Failed to create sink for {} ({}): {}", requester_id, peer, err);
            return;
        }
    };
    registry.register(&requester_id, Box::new(sink));
    info!("Serving {} from {}", requester_id, peer);

    push_snapshot(&requester_id, player, registry);

    // Serving: block on reads until end-of-stream or an IO error.
    loop {
        let code = match protocol::read_line(&mut reader) {
            Ok(Some(code)) => code,
            Ok(None) => break,
            Err(err) => {
                debug!("Read from {} failed: {}", requester_id, err);
                break;
            }
        };
        match ClientRequest::read(&code, &mut reader) {
            Ok(Some(request)) => dispatch_request(request, &requester_id, player, registry),
            Ok(None) => debug!("Ignoring unknown code {:?} from {}", code, requester_id),
            Err(err) => {
                debug!("Request from {} truncated: {}", requester_id, err);
                break;
            }
        }
    }

    // Closed: drop the registration and release the socket. Not retried;
    // the client reconnects and re-handshakes.
    registry.unregister(&requester_id);
    info!("Connection from {} ({}) closed", requester_id, peer);
}

fn read_handshake(reader: &mut impl io::BufRead) -> io::Result<String> {
    let _code = protocol::read_schema_line(reader)?;
    protocol::read_schema_line(reader)
}

/// Pushes the full current state to one freshly connected client.
fn push_snapshot(
    requester_id: &str,
    player: &Arc<Mutex<PlayerData>>,
    registry: &Arc<ClientRegistry>,
) {
    let snapshot = player
        .lock()
        .expect("player data lock poisoned")
        .snapshot();
    registry.send_to(requester_id, &ServerFrame::SongList(snapshot.song_list));
    registry.send_to(requester_id, &ServerFrame::QueueList(snapshot.queue_list));
    if let Some(now_playing) = snapshot.now_playing {
        registry.send_to(requester_id, &ServerFrame::NowPlaying(now_playing));
    }
}

fn dispatch_request(
    request: ClientRequest,
    requester_id: &str,
    player: &Arc<Mutex<PlayerData>>,
    registry: &Arc<ClientRegistry>,
) {
    match request {
        ClientRequest::Queue { requester, track } => {
            // The resulting SERVER_ENQUEUED goes to everyone via the bus
            // forwarder, not just this connection.
            let result = player
                .lock()
                .expect("player data lock poisoned")
                .enqueue(&requester, &track);
            if result.is_none() {
                debug!(
                    "Enqueue of {:?} from {} rejected: not a loaded track",
                    track, requester
                );
            }
        }
        ClientRequest::SongRequest => {
            let song_list = player
                .lock()
                .expect("player data lock poisoned")
                .snapshot()
                .song_list;
            registry.send_to(requester_id, &ServerFrame::SongList(song_list));
        }
        ClientRequest::QueueRequest => {
            let queue_list = player
                .lock()
                .expect("player data lock poisoned")
                .queue_list();
            registry.send_to(requester_id, &ServerFrame::QueueList(queue_list));
        }
        ClientRequest::NowPlayingRequest => {
            let now_playing = player
                .lock()
                .expect("player data lock poisoned")
                .snapshot()
                .now_playing;
            match now_playing {
                Some(now_playing) => {
                    registry.send_to(requester_id, &ServerFrame::NowPlaying(now_playing));
                }
                None => debug!(
                    "Now-playing request from {} while idle, nothing to send",
                    requester_id
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;
    use std::time::Instant;

    use tokio::sync::broadcast;

    use crate::protocol::SENTINEL;

    struct ServerHarness {
        manager: Arc<BroadcastManager>,
        player: Arc<Mutex<PlayerData>>,
        registry: Arc<ClientRegistry>,
        // Keeps the bus alive for the forwarder thread.
        _bus: Sender<Message>,
    }

    impl ServerHarness {
        fn start(track_names: &[&str]) -> ServerHarness {
            let (bus, _) = broadcast::channel(4096);
            let player = Arc::new(Mutex::new(PlayerData::new(bus.clone(), false)));
            if !track_names.is_empty() {
                let paths: Vec<PathBuf> = track_names
                    .iter()
                    .map(|name| PathBuf::from(format!("/music/{}", name)))
                    .collect();
                player
                    .lock()
                    .unwrap()
                    .add_tracks(&paths);
            }
            let config = NetworkConfig {
                port: 0,
                bind_address: "127.0.0.1".to_string(),
                worker_threads: 2,
            };
            let registry = Arc::new(ClientRegistry::new());
            let manager = Arc::new(BroadcastManager::new(
                config,
                Arc::clone(&player),
                Arc::clone(&registry),
                bus.clone(),
            ));
            manager.start().expect("server failed to start");
            ServerHarness {
                manager,
                player,
                registry,
                _bus: bus,
            }
        }

        fn address(&self) -> SocketAddr {
            self.manager.server_address().expect("server has no address")
        }
    }

    impl Drop for ServerHarness {
        fn drop(&mut self) {
            self.manager.stop();
        }
    }

    struct TestClient {
        reader: BufReader<TcpStream>,
        stream: TcpStream,
    }

    impl TestClient {
        /// Connects and completes the two-line handshake.
        fn connect(address: SocketAddr, requester_id: &str) -> TestClient {
            let stream = TcpStream::connect(address).expect("connect failed");
            stream
                .set_read_timeout(Some(Duration::from_secs(2)))
                .expect("set_read_timeout failed");
            let reader = BufReader::new(stream.try_clone().expect("clone failed"));
            let mut client = TestClient { reader, stream };
            client.send_lines(&["CLIENT_HELLO", requester_id]);
            client
        }

        fn send_lines(&mut self, lines: &[&str]) {
            for line in lines {
                self.stream
                    .write_all(line.as_bytes())
                    .expect("write failed");
                self.stream.write_all(b"\n").expect("write failed");
            }
            self.stream.flush().expect("flush failed");
        }

        /// Reads one frame group: code line through sentinel line.
        fn read_frame(&mut self) -> Vec<String> {
            let mut lines = Vec::new();
            loop {
                let line = protocol::read_line(&mut self.reader)
                    .expect("read failed")
                    .expect("stream ended mid-frame");
                let done = line == SENTINEL;
                lines.push(line);
                if done {
                    return lines;
                }
            }
        }

        /// Reads frames until one with the wanted code arrives, skipping
        /// interleaved broadcasts.
        fn wait_for_frame(&mut self, code: &str) -> Vec<String> {
            let deadline = Instant::now() + Duration::from_secs(2);
            loop {
                assert!(
                    Instant::now() < deadline,
                    "timed out waiting for {}",
                    code
                );
                let frame = self.read_frame();
                if frame[0] == code {
                    return frame;
                }
            }
        }
    }

    #[test]
    fn start_is_idempotent() {
        let harness = ServerHarness::start(&[]);
        assert!(harness.manager.is_running());
        // Second start warns and succeeds without rebinding.
        let address = harness.address();
        harness.manager.start().expect("second start failed");
        assert_eq!(harness.address(), address);
    }

    #[test]
    fn new_connection_receives_the_full_snapshot() {
        let harness = ServerHarness::start(&["a.mp3", "b.mp3"]);
        let mut client = TestClient::connect(harness.address(), "phone-1");

        let song_list = client.read_frame();
        assert_eq!(
            song_list,
            vec!["SERVER_SONG_LIST", "a.mp3", "b.mp3", SENTINEL]
        );
        let queue_list = client.read_frame();
        assert_eq!(queue_list, vec!["SERVER_QUEUE_LIST", SENTINEL]);
        // First load started playback on the host.
        let now_playing = client.read_frame();
        assert_eq!(now_playing, vec!["SERVER_NOW_PLAYING", "a.mp3", SENTINEL]);
    }

    #[test]
    fn enqueue_request_is_broadcast_to_every_client() {
        let harness = ServerHarness::start(&["x.mp3", "y.mp3"]);
        let mut client_a = TestClient::connect(harness.address(), "A");
        let mut client_b = TestClient::connect(harness.address(), "B");
        // Both snapshots done means both clients are registered.
        client_a.wait_for_frame("SERVER_NOW_PLAYING");
        client_b.wait_for_frame("SERVER_NOW_PLAYING");

        client_a.send_lines(&["CLIENT_QUEUE", "A", "y.mp3"]);

        let enqueued_a = client_a.wait_for_frame("SERVER_ENQUEUED");
        assert_eq!(
            enqueued_a,
            vec!["SERVER_ENQUEUED", "y.mp3", "A", "1", SENTINEL]
        );
        let enqueued_b = client_b.wait_for_frame("SERVER_ENQUEUED");
        assert_eq!(enqueued_b, enqueued_a);
    }

    #[test]
    fn advance_emits_move_up_then_now_playing() {
        let harness = ServerHarness::start(&["warmup.mp3", "x.mp3"]);
        let mut client = TestClient::connect(harness.address(), "A");
        client.wait_for_frame("SERVER_NOW_PLAYING");

        client.send_lines(&["CLIENT_QUEUE", "A", "x.mp3"]);
        client.wait_for_frame("SERVER_ENQUEUED");

        harness.player.lock().unwrap().advance();

        let move_up = client.read_frame();
        assert_eq!(move_up, vec!["SERVER_MOVE_UP", SENTINEL]);
        let now_playing = client.read_frame();
        assert_eq!(now_playing, vec!["SERVER_NOW_PLAYING", "x.mp3", SENTINEL]);
    }

    #[test]
    fn direct_requests_answer_only_the_requesting_client() {
        let harness = ServerHarness::start(&["a.mp3"]);
        let mut client = TestClient::connect(harness.address(), "A");
        client.wait_for_frame("SERVER_NOW_PLAYING");

        client.send_lines(&["CLIENT_SONG_REQUEST"]);
        let song_list = client.wait_for_frame("SERVER_SONG_LIST");
        assert_eq!(song_list, vec!["SERVER_SONG_LIST", "a.mp3", SENTINEL]);

        client.send_lines(&["CLIENT_QUEUE_REQUEST"]);
        let queue_list = client.wait_for_frame("SERVER_QUEUE_LIST");
        assert_eq!(queue_list, vec!["SERVER_QUEUE_LIST", SENTINEL]);

        client.send_lines(&["CLIENT_NOW_PLAYING_REQUEST"]);
        let now_playing = client.wait_for_frame("SERVER_NOW_PLAYING");
        assert_eq!(now_playing, vec!["SERVER_NOW_PLAYING", "a.mp3", SENTINEL]);
    }

    #[test]
    fn unknown_codes_are_ignored_and_the_connection_survives() {
        let harness = ServerHarness::start(&["a.mp3"]);
        let mut client = TestClient::connect(harness.address(), "A");
        client.wait_for_frame("SERVER_NOW_PLAYING");

        client.send_lines(&["CLIENT_DANCE"]);
        client.send_lines(&["CLIENT_SONG_REQUEST"]);
        let song_list = client.wait_for_frame("SERVER_SONG_LIST");
        assert_eq!(song_list[0], "SERVER_SONG_LIST");
    }

    #[test]
    fn rejected_enqueue_changes_no_state() {
        let harness = ServerHarness::start(&["a.mp3"]);
        let mut client = TestClient::connect(harness.address(), "A");
        client.wait_for_frame("SERVER_NOW_PLAYING");

        client.send_lines(&["CLIENT_QUEUE", "A", "ghost.mp3"]);
        client.send_lines(&["CLIENT_QUEUE_REQUEST"]);
        let queue_list = client.wait_for_frame("SERVER_QUEUE_LIST");
        assert_eq!(queue_list, vec!["SERVER_QUEUE_LIST", SENTINEL]);
        assert!(harness.player.lock().unwrap().queue_entries().is_empty());
    }

    #[test]
    fn restart_broadcasts_each_notification_once() {
        let harness = ServerHarness::start(&["a.mp3", "b.mp3"]);
        harness.manager.stop();
        harness.manager.start().expect("restart failed");
        let mut client = TestClient::connect(harness.address(), "A");
        client.wait_for_frame("SERVER_NOW_PLAYING");

        client.send_lines(&["CLIENT_QUEUE", "A", "b.mp3"]);
        client.wait_for_frame("SERVER_ENQUEUED");

        // A stale forwarder from the first start() would deliver its own
        // copy of the broadcast; read up to the reply of a follow-up
        // request and count strays.
        client.send_lines(&["CLIENT_QUEUE_REQUEST"]);
        let mut duplicates = 0;
        loop {
            let frame = client.read_frame();
            if frame[0] == "SERVER_QUEUE_LIST" {
                break;
            }
            if frame[0] == "SERVER_ENQUEUED" {
                duplicates += 1;
            }
        }
        assert_eq!(
            duplicates, 0,
            "one enqueue must yield exactly one SERVER_ENQUEUED frame"
        );
    }

    #[test]
    fn stop_refuses_new_connections() {
        let harness = ServerHarness::start(&[]);
        let address = harness.address();
        harness.manager.stop();
        assert!(!harness.manager.is_running());
        // The accept loop has exited and the listener is closed.
        thread::sleep(Duration::from_millis(100));
        assert!(TcpStream::connect_timeout(&address, Duration::from_millis(500)).is_err());
    }

    #[test]
    fn disconnect_unregisters_the_client() {
        let harness = ServerHarness::start(&["a.mp3"]);
        let mut client = TestClient::connect(harness.address(), "A");
        client.wait_for_frame("SERVER_NOW_PLAYING");
        drop(client);

        // The worker observes EOF and removes the registration; give the
        // teardown a moment.
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            if harness.registry.is_empty() {
                break;
            }
            assert!(Instant::now() < deadline, "client was never unregistered");
            thread::sleep(Duration::from_millis(20));
        }
    }
}
