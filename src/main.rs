mod broadcast_manager;
mod client_registry;
mod config;
mod media_file_discovery;
mod player_data;
mod protocol;
mod track;

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;

use log::{error, info, warn};
use tokio::sync::broadcast;

use broadcast_manager::BroadcastManager;
use client_registry::ClientRegistry;
use config::Config;
use player_data::PlayerData;
use protocol::{GuiNotification, Message};

fn main() {
    let mut clog = colog::default_builder();
    clog.filter(None, log::LevelFilter::Debug);
    clog.init();

    std::panic::set_hook(Box::new(|panic_info| {
        let current_thread = std::thread::current();
        let thread_name = current_thread.name().unwrap_or("unnamed");
        log::error!("panic in thread '{}': {}", thread_name, panic_info);
    }));

    let config = match Config::default_path() {
        Some(path) => Config::load_or_create(&path),
        None => {
            warn!("No config directory on this platform. Using defaults.");
            Config::default()
        }
    };

    // Bus for communication between components
    let (bus_sender, _) = broadcast::channel(1024);

    let player = Arc::new(Mutex::new(PlayerData::new(
        bus_sender.clone(),
        config.playback.random_order,
    )));
    let registry = Arc::new(ClientRegistry::new());
    let manager = BroadcastManager::new(
        config.network.clone(),
        Arc::clone(&player),
        registry,
        bus_sender.clone(),
    );

    // Stand-in for the graphical observer: log what the GUI would render.
    let mut gui_receiver = bus_sender.subscribe();
    thread::spawn(move || loop {
        match gui_receiver.blocking_recv() {
            Ok(Message::Gui(GuiNotification::PlaybackChanged {
                current_track,
                next_in_queue,
                ..
            })) => {
                let now = current_track
                    .map(|track| track.to_string())
                    .unwrap_or_else(|| "-".to_string());
                let next = next_in_queue
                    .map(|track| track.to_string())
                    .unwrap_or_else(|| "-".to_string());
                info!("Now playing: {} (up next: {})", now, next);
            }
            Ok(Message::Gui(GuiNotification::ServerStarted(address))) => {
                info!("Clients can connect at {}", address);
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => break,
        }
    });

    let load_args: Vec<PathBuf> = std::env::args().skip(1).map(PathBuf::from).collect();
    if !load_args.is_empty() {
        let files = media_file_discovery::collect_audio_files(&load_args);
        let added = player
            .lock()
            .expect("player data lock poisoned")
            .add_tracks(&files);
        info!("Loaded {} tracks from command line", added.len());
    }

    if let Err(err) = manager.start() {
        error!("Failed to start broadcast server: {}", err);
        std::process::exit(1);
    }

    run_command_loop(&manager, &player);

    manager.stop();
}

/// Minimal host control surface standing in for the excluded GUI: one
/// command per stdin line.
fn run_command_loop(manager: &BroadcastManager, player: &Arc<Mutex<PlayerData>>) {
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                error!("Failed to read stdin: {}", err);
                break;
            }
        };
        let mut parts = line.trim().splitn(2, ' ');
        let command = parts.next().unwrap_or("");
        let argument = parts.next().unwrap_or("").trim();
        match command {
            "" => {}
            "next" => player.lock().expect("player data lock poisoned").advance(),
            "prev" => player.lock().expect("player data lock poisoned").previous(),
            "play" => {
                if !player
                    .lock()
                    .expect("player data lock poisoned")
                    .play_on_click(argument)
                {
                    warn!("No loaded track named {:?}", argument);
                }
            }
            "load" => {
                let files =
                    media_file_discovery::collect_audio_files(&[PathBuf::from(argument)]);
                let added = player
                    .lock()
                    .expect("player data lock poisoned")
                    .add_tracks(&files);
                info!("Loaded {} new tracks", added.len());
            }
            "random" => {
                let enable = argument == "on";
                player
                    .lock()
                    .expect("player data lock poisoned")
                    .set_random_order(enable);
                info!("Random order {}", if enable { "on" } else { "off" });
            }
            "queue" => {
                let queue = player
                    .lock()
                    .expect("player data lock poisoned")
                    .queue_list();
                if queue.is_empty() {
                    info!("Queue is empty");
                }
                for (position, (track, requester)) in queue.iter().enumerate() {
                    info!("{}: {} (requested by {})", position, track, requester);
                }
            }
            "status" => {
                let address = manager
                    .server_address()
                    .map(|address| address.to_string())
                    .unwrap_or_else(|| "not bound".to_string());
                info!(
                    "Server {} at {}",
                    if manager.is_running() { "running" } else { "stopped" },
                    address
                );
            }
            "quit" => break,
            other => warn!(
                "Unknown command {:?} (next, prev, play <name>, load <path>, random on|off, queue, status, quit)",
                other
            ),
        }
    }
}
