//! Board profiles: which pins and hosts the display and SD card use.
//!
//! Replaces compile-time board selection with a runtime configuration
//! source. A profile either puts the SD card on the display's bus or gives
//! it a bus of its own.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use embedded_hal::spi::{Mode, MODE_0, MODE_1, MODE_2, MODE_3};
use serde::{Deserialize, Serialize};
use spi_arbiter::{BusHandle, BusPins, ConfigError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusProfile {
    pub host: u8,
    pub sclk: u8,
    pub miso: Option<u8>,
    pub mosi: Option<u8>,
    pub max_transfer_size: usize,
    #[serde(default)]
    pub dma_channel: Option<u8>,
    #[serde(default)]
    pub max_frequency: Option<u32>,
}

impl BusProfile {
    pub fn handle(&self) -> Result<BusHandle, ConfigError> {
        let pins = BusPins {
            sclk: self.sclk,
            miso: self.miso,
            mosi: self.mosi,
        };
        let bus = BusHandle::initialize(
            self.host,
            pins,
            self.max_transfer_size,
            self.dma_channel,
        )?;
        match self.max_frequency {
            Some(hz) => bus.with_max_frequency(hz),
            None => Ok(bus),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceProfile {
    pub chip_select: u8,
    pub frequency: u32,
    /// SPI mode number, 0 to 3.
    #[serde(default)]
    pub mode: u8,
}

impl DeviceProfile {
    pub fn spi_mode(&self) -> Result<Mode> {
        Ok(match self.mode {
            0 => MODE_0,
            1 => MODE_1,
            2 => MODE_2,
            3 => MODE_3,
            other => bail!("invalid SPI mode {other}"),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdCardProfile {
    #[serde(flatten)]
    pub device: DeviceProfile,
    /// Dedicated bus for the card; shares the display bus when absent.
    #[serde(default)]
    pub bus: Option<BusProfile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardProfile {
    pub name: String,
    pub bus: BusProfile,
    pub display: DeviceProfile,
    pub sdcard: SdCardProfile,
}

impl BoardProfile {
    /// M5Stack Core: ILI9341 and the card slot on one VSPI bus.
    pub fn m5stack() -> Self {
        Self {
            name: "m5stack".into(),
            bus: BusProfile {
                host: 2,
                sclk: 18,
                miso: Some(19),
                mosi: Some(23),
                max_transfer_size: 4000,
                dma_channel: Some(2),
                max_frequency: None,
            },
            display: DeviceProfile {
                chip_select: 14,
                frequency: 40_000_000,
                mode: 0,
            },
            sdcard: SdCardProfile {
                device: DeviceProfile {
                    chip_select: 4,
                    frequency: 20_000_000,
                    mode: 0,
                },
                bus: None,
            },
        }
    }

    /// ESP-WROVER-KIT: display on HSPI, card slot wired to its own host.
    pub fn wrover_kit() -> Self {
        Self {
            name: "wrover-kit".into(),
            bus: BusProfile {
                host: 1,
                sclk: 19,
                miso: Some(25),
                mosi: Some(23),
                max_transfer_size: 4000,
                dma_channel: Some(1),
                max_frequency: None,
            },
            display: DeviceProfile {
                chip_select: 22,
                frequency: 40_000_000,
                mode: 0,
            },
            sdcard: SdCardProfile {
                device: DeviceProfile {
                    chip_select: 13,
                    frequency: 20_000_000,
                    mode: 0,
                },
                bus: Some(BusProfile {
                    host: 2,
                    sclk: 14,
                    miso: Some(2),
                    mosi: Some(15),
                    max_transfer_size: 4000,
                    dma_channel: Some(2),
                    max_frequency: None,
                }),
            },
        }
    }
}

/// Supplies the board profile at startup.
pub trait ConfigSource {
    fn load(&self) -> Result<BoardProfile>;
}

/// One of the profiles compiled into the binary.
pub struct Builtin(pub String);

impl Builtin {
    pub const NAMES: [&'static str; 2] = ["m5stack", "wrover-kit"];
}

impl ConfigSource for Builtin {
    fn load(&self) -> Result<BoardProfile> {
        match self.0.as_str() {
            "m5stack" => Ok(BoardProfile::m5stack()),
            "wrover-kit" => Ok(BoardProfile::wrover_kit()),
            other => bail!(
                "unknown board {other:?}, expected one of {:?}",
                Self::NAMES
            ),
        }
    }
}

/// A profile stored as JSON.
pub struct JsonFile(pub PathBuf);

impl ConfigSource for JsonFile {
    fn load(&self) -> Result<BoardProfile> {
        let text = std::fs::read_to_string(&self.0)
            .with_context(|| format!("reading {}", self.0.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", self.0.display()))
    }
}
