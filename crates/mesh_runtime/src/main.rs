//! Meshsync Runtime
//!
//! Boots an in-process cluster of peers over the loopback hub and drives it
//! with a fixed-rate tick loop.
//!
//! ```text
//! meshsync [--peers N] [--seconds S] [--settings PATH] [--profiles PATH]
//! ```

mod cluster;
mod demo;

use anyhow::{bail, Context, Result};
use cluster::Cluster;
use mesh_core::time::SimulationTime;
use mesh_core::PeerId;
use mesh_metrics::TickTimer;
use mesh_services::{ProfileStore, Settings};
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::{interval, Instant, MissedTickBehavior};

/// Presentation rate of the frame loop.
const FRAME_INTERVAL: Duration = Duration::from_millis(8);
const TAG_EVERY: Duration = Duration::from_secs(2);

#[derive(Debug)]
struct Options {
    peers: u64,
    seconds: u64,
    settings: Option<PathBuf>,
    profiles: Option<PathBuf>,
}

impl Options {
    fn parse(args: impl Iterator<Item = String>) -> Result<Self> {
        let mut options = Options {
            peers: 3,
            seconds: 10,
            settings: None,
            profiles: None,
        };
        let mut args = args;
        while let Some(flag) = args.next() {
            let mut value = || args.next().with_context(|| format!("{flag} needs a value"));
            match flag.as_str() {
                "--peers" => options.peers = value()?.parse().context("--peers")?,
                "--seconds" => options.seconds = value()?.parse().context("--seconds")?,
                "--settings" => options.settings = Some(value()?.into()),
                "--profiles" => options.profiles = Some(value()?.into()),
                other => bail!("unknown argument {other}"),
            }
        }
        if options.peers == 0 {
            bail!("--peers must be at least 1");
        }
        Ok(options)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let options = Options::parse(std::env::args().skip(1))?;
    tracing::info!("Meshsync v{} (protocol {})", mesh_core::VERSION, mesh_net::PROTOCOL_VERSION);

    let settings = match &options.settings {
        Some(path) => Settings::load(path).context("loading settings")?,
        None => Settings::default(),
    };
    let profiles = match &options.profiles {
        Some(path) => ProfileStore::load(path).context("loading profiles")?,
        None => ProfileStore::new(),
    };

    let mut cluster = Cluster::new(options.peers, &settings, &profiles)?;
    run(&mut cluster, &settings, &options).await?;
    cluster.report();
    Ok(())
}

async fn run(cluster: &mut Cluster, settings: &Settings, options: &Options) -> Result<()> {
    let mut time = SimulationTime::new(settings.net.tick_rate_hz);
    let mut timer = TickTimer::new(settings.net.tick_rate_hz as usize, time.tick_duration());
    let mut frames = interval(FRAME_INTERVAL);
    frames.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let started_at = Instant::now();
    let deadline = started_at + Duration::from_secs(options.seconds);
    let departure = started_at + Duration::from_secs(options.seconds / 2);
    let mut last_frame = started_at;
    let mut last_tag = started_at;
    let mut game_requested = false;
    let mut drones_spawned = false;
    let mut departed = false;

    tracing::info!(peers = options.peers, seconds = options.seconds, "cluster running");
    loop {
        tokio::select! {
            now = frames.tick() => {
                if now >= deadline {
                    break;
                }
                cluster.poll();
                cluster.log_events();

                if !game_requested && cluster.handshake_done() {
                    cluster.start_game()?;
                    game_requested = true;
                }
                if !drones_spawned && cluster.all_started() {
                    cluster.spawn_drones()?;
                    drones_spawned = true;
                }
                if !departed && options.peers >= 3 && now >= departure {
                    cluster.depart(PeerId(options.peers));
                    departed = true;
                }
                if drones_spawned && now.duration_since(last_tag) >= TAG_EVERY {
                    cluster.tag_round();
                    last_tag = now;
                }

                let elapsed = now.duration_since(last_frame);
                last_frame = now;
                for _ in 0..time.advance(elapsed) {
                    timer.begin();
                    cluster.steer();
                    cluster.tick(time.tick_delta());
                    timer.end();
                }
                cluster.frame(elapsed.as_secs_f32());
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("waiting for ctrl-c")?;
                tracing::info!("interrupted");
                break;
            }
        }
    }

    tracing::info!(
        ticks = time.tick_count(),
        avg_ms = timer.average_ms(),
        worst_ms = timer.worst_ms(),
        load = timer.load(),
        overruns = timer.overruns(),
        "tick loop finished"
    );
    Ok(())
}
