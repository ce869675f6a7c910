use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_time::{Duration, Timer};

use crate::arbiter::BusArbiter;
use crate::factory::BusFactory;
use crate::session::SessionId;

/// A grant held for longer than the arbiter's watchdog duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StuckBus {
    pub host: u8,
    pub session: SessionId,
    /// Chip-select line of the holder, if it is still registered.
    pub chip_select: Option<u8>,
    pub held_for: Duration,
    /// Sessions queued behind the holder when the report was taken.
    pub waiters: usize,
}

/// Receives watchdog reports.
pub trait BusObserver {
    fn bus_stuck(&self, report: &StuckBus);
}

impl<M: RawMutex, F: BusFactory, const N: usize> BusArbiter<M, F, N> {
    /// Report the current grant if it has been held past the watchdog
    /// duration.
    ///
    /// Each grant is reported at most once. The bus is never force-released:
    /// the holder may be in the middle of a transfer.
    pub fn check_watchdog(&self) -> Option<StuckBus> {
        let report = self.take_stuck()?;

        #[cfg(feature = "defmt")]
        defmt::warn!(
            "spi{}: session {} has held the bus for {} ms ({} waiting)",
            report.host,
            report.session,
            report.held_for.as_millis(),
            report.waiters
        );
        Some(report)
    }

    /// Poll [`check_watchdog`](Self::check_watchdog) forever, forwarding
    /// reports to `observer`.
    pub async fn run_watchdog<O: BusObserver>(&self, observer: &O) {
        let period =
            Duration::from_ticks((self.watchdog().as_ticks() / 2).max(1));
        loop {
            Timer::after(period).await;
            if let Some(report) = self.check_watchdog() {
                observer.bus_stuck(&report);
            }
        }
    }
}
