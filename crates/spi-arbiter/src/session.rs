use embassy_sync::blocking_mutex::raw::RawMutex;
use embedded_hal::spi::Mode;
use portable_atomic::{AtomicU32, Ordering};

use crate::arbiter::BusArbiter;
use crate::error::ConfigError;
use crate::factory::BusFactory;

static NEXT_SESSION: AtomicU32 = AtomicU32::new(1);

/// Process-wide unique, monotonically increasing session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SessionId(u32);

impl SessionId {
    pub(crate) fn next() -> Self {
        Self(NEXT_SESSION.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

/// Per-device transfer parameters applied before each transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DeviceConfig {
    pub chip_select: u8,
    pub frequency: u32,
    pub mode: Mode,
}

/// One peripheral's binding to a shared bus.
///
/// A session is immutable once registered. It is owned by the driver that
/// registered it and handed back to [`BusArbiter::deregister`] when the
/// driver goes away.
#[derive(Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DeviceSession {
    id: SessionId,
    host: u8,
    config: DeviceConfig,
}

impl DeviceSession {
    /// Registers a device on the bus owned by `arbiter`.
    pub fn register<M: RawMutex, F: BusFactory, const N: usize>(
        arbiter: &BusArbiter<M, F, N>,
        chip_select: u8,
        frequency: u32,
        mode: Mode,
    ) -> Result<Self, ConfigError> {
        let config = DeviceConfig { chip_select, frequency, mode };
        let id = arbiter.register(&config)?;
        Ok(Self { id, host: arbiter.bus().host(), config })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Host id of the bus this session is attached to.
    pub fn host(&self) -> u8 {
        self.host
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn chip_select(&self) -> u8 {
        self.config.chip_select
    }
}
