use crate::error::ConfigError;

/// GPIO assignment of the shared bus lines.
///
/// A data line may be left unassigned (`None`) for write-only or read-only
/// buses, but not both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BusPins {
    pub sclk: u8,
    pub miso: Option<u8>,
    pub mosi: Option<u8>,
}

impl BusPins {
    fn iter(&self) -> impl Iterator<Item = u8> {
        [Some(self.sclk), self.miso, self.mosi].into_iter().flatten()
    }
}

/// Static description of one physical SPI bus.
///
/// Creating a handle only validates and records the wiring. The peripheral
/// itself is brought up by the [`BusArbiter`](crate::BusArbiter) on first
/// acquisition, so two handles may be declared before it is known whether
/// they map to the same peripheral.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BusHandle {
    host: u8,
    pins: BusPins,
    max_transfer_size: usize,
    dma_channel: Option<u8>,
    max_frequency: u32,
}

impl BusHandle {
    /// Rated clock when none is given.
    pub const DEFAULT_MAX_FREQUENCY: u32 = 80_000_000;

    pub fn initialize(
        host: u8,
        pins: BusPins,
        max_transfer_size: usize,
        dma_channel: Option<u8>,
    ) -> Result<Self, ConfigError> {
        if max_transfer_size == 0 {
            return Err(ConfigError::ZeroTransferSize);
        }
        if pins.miso.is_none() && pins.mosi.is_none() {
            return Err(ConfigError::NoDataLine);
        }

        for (i, pin) in pins.iter().enumerate() {
            if pins.iter().skip(i + 1).any(|other| other == pin) {
                return Err(ConfigError::PinConflict { pin });
            }
        }

        Ok(Self {
            host,
            pins,
            max_transfer_size,
            dma_channel,
            max_frequency: Self::DEFAULT_MAX_FREQUENCY,
        })
    }

    /// Sets the highest clock any device on this bus may request.
    pub fn with_max_frequency(mut self, hz: u32) -> Result<Self, ConfigError> {
        if hz == 0 {
            return Err(ConfigError::ZeroFrequency);
        }
        self.max_frequency = hz;
        Ok(self)
    }

    pub fn host(&self) -> u8 {
        self.host
    }

    pub fn pins(&self) -> &BusPins {
        &self.pins
    }

    pub fn max_transfer_size(&self) -> usize {
        self.max_transfer_size
    }

    pub fn dma_channel(&self) -> Option<u8> {
        self.dma_channel
    }

    pub fn max_frequency(&self) -> u32 {
        self.max_frequency
    }

    /// Returns `true` if `pin` drives one of the shared bus lines.
    pub fn uses_pin(&self, pin: u8) -> bool {
        self.pins.iter().any(|p| p == pin)
    }
}
