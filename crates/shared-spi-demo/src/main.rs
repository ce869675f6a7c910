mod board;
mod display;
mod sim;
mod storage;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Timer};
use serde::Serialize;
use spi_arbiter::{BusArbiter, BusObserver, DeviceSession, StuckBus};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::board::{
    BoardProfile, Builtin, ConfigSource, DeviceProfile, JsonFile,
};
use crate::display::Display;
use crate::sim::{SimFactory, SimResources, Wire, WireReport};
use crate::storage::Storage;

/// Arbiter for one simulated host; room for four devices.
pub(crate) type Arbiter = BusArbiter<CriticalSectionRawMutex, SimFactory, 4>;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Display and SD card sharing one SPI bus, on a simulated port"
)]
struct Args {
    /// Built-in board profile (m5stack, wrover-kit)
    #[arg(short, long, default_value = "m5stack")]
    board: String,

    /// JSON board profile, overrides --board
    #[arg(long)]
    board_file: Option<PathBuf>,

    /// Seconds to count down before writing to the card
    #[arg(short, long, default_value_t = 10)]
    countdown: u32,

    /// Display render period
    #[arg(long, default_value_t = 10)]
    frame_interval_ms: u64,

    /// How long one bus acquisition may wait
    #[arg(long, default_value_t = 100)]
    acquire_timeout_ms: u64,

    /// Report a bus held longer than this
    #[arg(long, default_value_t = 2000)]
    watchdog_ms: u64,

    /// Reset commands the simulated card ignores before it answers
    #[arg(long, default_value_t = 0)]
    slow_card: u32,
}

struct Settings {
    countdown: u32,
    count_period: Duration,
    frame_interval: Duration,
    acquire_timeout: Duration,
    watchdog: Duration,
    mount_retry: Duration,
    slow_card: u32,
}

impl From<&Args> for Settings {
    fn from(args: &Args) -> Self {
        Self {
            countdown: args.countdown,
            count_period: Duration::from_secs(1),
            frame_interval: Duration::from_millis(args.frame_interval_ms),
            acquire_timeout: Duration::from_millis(args.acquire_timeout_ms),
            watchdog: Duration::from_millis(args.watchdog_ms),
            mount_retry: Duration::from_secs(1),
            slow_card: args.slow_card,
        }
    }
}

#[derive(Debug, Serialize)]
struct Summary {
    board: String,
    card: String,
    line: String,
    frames: u32,
    skipped_frames: u32,
    display_bus: WireReport,
    /// Traffic of the card's own bus when it does not share the display's.
    card_bus: Option<WireReport>,
}

/// Logs stuck buses; the holder is left alone.
struct LogObserver;

impl BusObserver for LogObserver {
    fn bus_stuck(&self, report: &StuckBus) {
        warn!(
            host = report.host,
            session = report.session.get(),
            chip_select = ?report.chip_select,
            held_ms = report.held_for.as_millis(),
            waiters = report.waiters,
            "spi bus held past watchdog"
        );
    }
}

fn host(wire: &Arc<Wire>) -> SimResources {
    SimResources { wire: wire.clone() }
}

fn register(
    arbiter: &Arbiter,
    device: &DeviceProfile,
) -> Result<DeviceSession> {
    DeviceSession::register(
        arbiter,
        device.chip_select,
        device.frequency,
        device.spi_mode()?,
    )
    .map_err(|err| anyhow!("cs {}: {err:?}", device.chip_select))
}

/// Count down, then mount the card, write, rename and read back a file.
async fn storage_routine(
    mut card: Storage<'_>,
    settings: &Settings,
) -> Result<(String, String)> {
    info!("screen is working, writing to the card in...");
    for remaining in (1..=settings.countdown).rev() {
        info!("..{remaining}");
        Timer::after(settings.count_period).await;
    }

    info!("writing to card");
    let name = card.mount().await?.to_owned();
    info!(card = %name, "opening file");
    card.write_file("hello.txt", format!("Hello {name}!").as_bytes())
        .await?;
    info!("file written");

    if card.exists("foo.txt")? {
        card.remove("foo.txt")?;
    }
    info!("renaming file");
    card.rename("hello.txt", "foo.txt").context("rename failed")?;

    info!("reading file");
    let line = card.read_line("foo.txt").await?;
    info!("read from file: {line}");

    card.unmount().await?;
    info!("sd card routine complete");
    Ok((name, line))
}

async fn run(profile: &BoardProfile, settings: &Settings) -> Result<Summary> {
    let display_wire = Arc::new(Wire::default());
    let bus = profile
        .bus
        .handle()
        .map_err(|err| anyhow!("display bus: {err:?}"))?;
    let shared = Arbiter::new(bus, host(&display_wire))
        .with_watchdog(settings.watchdog);

    let card_wire = Arc::new(Wire::default());
    let dedicated = match &profile.sdcard.bus {
        Some(card_bus) => {
            let bus = card_bus
                .handle()
                .map_err(|err| anyhow!("card bus: {err:?}"))?;
            Some(
                Arbiter::new(bus, host(&card_wire))
                    .with_watchdog(settings.watchdog),
            )
        }
        None => None,
    };
    let card_arbiter = dedicated.as_ref().unwrap_or(&shared);
    let card_side = if dedicated.is_some() { &card_wire } else { &display_wire };
    card_side.fail_next_inits(settings.slow_card);

    let mut display = Display::new(
        &shared,
        register(&shared, &profile.display)?,
        settings.acquire_timeout,
    );
    let card = Storage::new(
        card_arbiter,
        register(card_arbiter, &profile.sdcard.device)?,
        settings.acquire_timeout,
    )
    .with_retry_delay(settings.mount_retry);

    let stop = Signal::new();
    let routine = async {
        let result = storage_routine(card, settings).await;
        // The screen keeps going until the card is done.
        stop.signal(());
        result
    };
    let work = async {
        tokio::join!(routine, display.run(settings.frame_interval, &stop))
    };
    let watchdogs = async {
        let observer = LogObserver;
        match &dedicated {
            Some(card_arbiter) => {
                tokio::join!(
                    shared.run_watchdog(&observer),
                    card_arbiter.run_watchdog(&observer)
                );
            }
            None => shared.run_watchdog(&observer).await,
        }
    };

    let (routine, rendered) = tokio::select! {
        done = work => done,
        () = watchdogs => bail!("watchdog stopped"),
    };
    rendered?;
    let (card, line) = routine?;

    Ok(Summary {
        board: profile.name.clone(),
        card,
        line,
        frames: display.frames(),
        skipped_frames: display.skipped(),
        display_bus: display_wire.report(),
        card_bus: dedicated.as_ref().map(|_| card_wire.report()),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let source: Box<dyn ConfigSource> = match &args.board_file {
        Some(path) => Box::new(JsonFile(path.clone())),
        None => Box::new(Builtin(args.board.clone())),
    };
    let profile = source.load()?;
    info!(board = %profile.name, "profile loaded");

    let summary = run(&profile, &Settings::from(&args)).await?;
    let contention = summary.display_bus.contention
        + summary.card_bus.as_ref().map_or(0, |r| r.contention);
    if contention > 0 {
        warn!(contention, "devices overlapped on the bus");
    }
    info!("screen is now frozen");
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
