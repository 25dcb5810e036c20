use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::{Receiver, TryRecvError, unbounded};
use glam::Vec3;

use multiplayer::entity::{ComponentDescriptor, PropertyValue};
use multiplayer::{
    CvarRegistry, MultiplayerConfig, MultiplayerSystem, PrefabDescriptor, SessionEvent,
    UdpNetworking, UdpSettings, ViewVolume,
};

const STATS_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "mp-node")]
#[command(about = "Multiplayer session node: hosts or joins a replicated session")]
struct Args {
    #[arg(long, help = "TOML file with startup settings")]
    config: Option<PathBuf>,

    #[arg(long, help = "Host without a local player")]
    dedicated: bool,

    #[arg(short, long, help = "Join the given host[:port] instead of hosting")]
    connect: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(short, long)]
    map: Option<String>,

    #[arg(long, help = "Milliseconds between host send ticks")]
    send_rate_ms: Option<u32>,

    #[arg(short, long, default_value_t = 60)]
    frame_rate: u32,

    #[arg(long, help = "Only blend entities within this distance of the origin")]
    view_radius: Option<f32>,

    #[arg(short, long, help = "Console command to run after startup (repeatable)")]
    exec: Vec<String>,
}

fn load_config(args: &Args) -> Result<MultiplayerConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let source = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            MultiplayerConfig::from_toml(&source)
                .with_context(|| format!("parsing {}", path.display()))?
        }
        None => MultiplayerConfig::default(),
    };

    if args.dedicated {
        config.dedicated = true;
    }
    if let Some(port) = args.port {
        config.port = port;
        config.server_port = port;
    }
    if let Some(map) = &args.map {
        config.map = map.clone();
    }
    if let Some(ms) = args.send_rate_ms {
        config.server_send_rate_ms = ms;
    }
    Ok(config)
}

fn player_prefab() -> PrefabDescriptor {
    PrefabDescriptor::single(vec![
        ComponentDescriptor::new("Health").with_property(PropertyValue::Int(100)),
        ComponentDescriptor::new("Name").with_property(PropertyValue::Text(String::new())),
    ])
}

/// Lines typed on stdin, read on their own thread.
fn spawn_stdin_reader(running: Arc<AtomicBool>) -> Receiver<String> {
    let (tx, rx) = unbounded();
    thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            let Ok(line) = line else {
                break;
            };
            if tx.send(line).is_err() || !running.load(Ordering::SeqCst) {
                break;
            }
        }
    });
    rx
}

fn run_command(system: &mut MultiplayerSystem, command: &str) {
    if let Err(e) = system.execute_console_command(command) {
        log::warn!("{}: {}", command, e);
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = load_config(&args)?;
    let network = UdpNetworking::new(UdpSettings::from_config(&config));
    let console = CvarRegistry::from_config(&config);
    let spawn_asset = config.default_player_spawn_asset.clone();

    let mut system = MultiplayerSystem::new(config, Box::new(network), Box::new(console));
    system.register_prefab(spawn_asset, player_prefab());
    system.set_camera(args.view_radius.map(|radius| ViewVolume {
        center: Vec3::ZERO,
        radius,
    }));
    let events = system.subscribe();

    match &args.connect {
        Some(target) => {
            system
                .connect(Some(target.as_str()))
                .with_context(|| format!("connecting to {}", target))?;
        }
        None => system.host().context("starting host")?,
    }
    for command in &args.exec {
        run_command(&mut system, command);
    }

    let running = Arc::new(AtomicBool::new(true));
    let input = spawn_stdin_reader(running.clone());
    let frame = Duration::from_secs_f64(1.0 / f64::from(args.frame_rate.max(1)));
    let mut last_frame = Instant::now();
    let mut last_stats = Instant::now();

    log::info!("Running as {}, type 'quit' to exit", system.agent_type());
    while running.load(Ordering::SeqCst) {
        loop {
            match input.try_recv() {
                Ok(line) => {
                    let line = line.trim();
                    if line.eq_ignore_ascii_case("quit") {
                        running.store(false, Ordering::SeqCst);
                    } else if !line.is_empty() {
                        run_command(&mut system, line);
                    }
                }
                // stdin closed: keep running headless.
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }

        let now = Instant::now();
        system.on_tick(now - last_frame);
        last_frame = now;

        for event in events.try_iter() {
            match event {
                SessionEvent::SessionShutdown if args.connect.is_some() => {
                    log::info!("Session ended");
                    running.store(false, Ordering::SeqCst);
                }
                event => log::debug!("{:?}", event),
            }
        }

        if last_stats.elapsed() >= STATS_INTERVAL {
            let stats = system.stats();
            log::info!(
                "frame {} | {} entities | {} clients | {} servers | {} B sent",
                stats.host_frame_id,
                stats.entity_count,
                stats.client_connection_count,
                stats.server_connection_count,
                stats.traffic.properties_sent.bytes + stats.traffic.rpcs_sent.bytes
            );
            last_stats = Instant::now();
        }

        thread::sleep(frame.saturating_sub(last_frame.elapsed()));
    }

    system.shutdown();
    log::info!("Shut down");
    Ok(())
}
