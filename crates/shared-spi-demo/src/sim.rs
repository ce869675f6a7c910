//! In-memory stand-in for the ESP32 SPI peripheral.
//!
//! The port records traffic per chip-select and counts every moment where a
//! second device is selected while another one still is. A card on the bus
//! answers SD command frames just enough for the storage driver to mount it
//! and move single blocks.

use std::collections::{BTreeMap, HashMap};
use std::convert::Infallible;
use std::sync::{Arc, Mutex};

use embassy_time::{Duration, Timer};
use embedded_hal_async::spi::{ErrorType, SpiBus};
use serde::Serialize;
use spi_arbiter::{BusFactory, BusHandle, DeviceConfig, SpiPort};
use tracing::{debug, trace, warn};

pub const R1_IDLE: u8 = 0x01;
pub const R1_READY: u8 = 0x00;
pub const DATA_TOKEN: u8 = 0xFE;
pub const CMD_GO_IDLE: u8 = 0;
pub const CMD_SEND_CID: u8 = 10;
pub const CMD_READ_BLOCK: u8 = 17;
pub const CMD_WRITE_BLOCK: u8 = 24;
/// Data response token for an accepted write.
pub const DATA_ACCEPTED: u8 = 0x05;
/// Data response token for a block refused with a CRC error.
const DATA_CRC_ERROR: u8 = 0x0B;
pub const BLOCK_LEN: usize = 512;
/// Length of an SD command frame: command, 4 argument bytes, CRC.
pub const COMMAND_LEN: usize = 6;

/// Card identification register of the simulated card.
const CID: [u8; 16] = [
    0x03, b'S', b'D', b'S', b'I', b'M', b'S', b'D', 0x80, 0x12, 0x34, 0x56,
    0x78, 0x01, 0x6A, 0x01,
];

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeviceTraffic {
    pub transactions: u64,
    pub bytes_out: u64,
    pub bytes_in: u64,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct WireReport {
    pub contention: u32,
    pub devices: BTreeMap<u8, DeviceTraffic>,
}

#[derive(Default)]
struct WireState {
    selected: Vec<u8>,
    report: WireReport,
    blocks: HashMap<u32, [u8; BLOCK_LEN]>,
    init_failures: u32,
    write_failures: u32,
}

/// Bus-level view shared by every port built on the same host.
#[derive(Default)]
pub struct Wire {
    state: Mutex<WireState>,
}

impl Wire {
    pub fn report(&self) -> WireReport {
        self.lock().report.clone()
    }

    /// Make the card ignore the next `count` reset commands.
    pub fn fail_next_inits(&self, count: u32) {
        self.lock().init_failures = count;
    }

    /// Make the card refuse the next `count` data blocks.
    pub fn reject_next_writes(&self, count: u32) {
        self.lock().write_failures = count;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, WireState> {
        // A panicking test thread must not hide the traffic seen so far.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn select(&self, line: u8) {
        let mut state = self.lock();
        if !state.selected.is_empty() {
            warn!(line, selected = ?state.selected, "bus contention");
            state.report.contention += 1;
        }
        state.selected.push(line);
        state.report.devices.entry(line).or_default().transactions += 1;
    }

    fn deselect(&self, line: u8) {
        self.lock().selected.retain(|&l| l != line);
    }

    fn take_init_failure(&self) -> bool {
        let mut state = self.lock();
        if state.init_failures == 0 {
            return false;
        }
        state.init_failures -= 1;
        true
    }

    fn take_write_failure(&self) -> bool {
        let mut state = self.lock();
        if state.write_failures == 0 {
            return false;
        }
        state.write_failures -= 1;
        true
    }

    fn load(&self, block: u32) -> [u8; BLOCK_LEN] {
        self.lock().blocks.get(&block).copied().unwrap_or([0; BLOCK_LEN])
    }

    fn store(&self, block: u32, data: &[u8]) {
        let mut copy = [0; BLOCK_LEN];
        copy.copy_from_slice(data);
        self.lock().blocks.insert(block, copy);
    }

    fn count(&self, line: Option<u8>, bytes_out: usize, bytes_in: usize) {
        let Some(line) = line else {
            return;
        };
        let mut state = self.lock();
        let traffic = state.report.devices.entry(line).or_default();
        traffic.bytes_out += bytes_out as u64;
        traffic.bytes_in += bytes_in as u64;
    }
}

pub struct SimPort {
    host: u8,
    wire: Arc<Wire>,
    selected: Option<u8>,
    frequency: u32,
    pending_command: Option<(u8, u32)>,
    /// Block address of an accepted write command awaiting its data.
    pending_block: Option<u32>,
    /// Token owed for the last data block.
    data_response: Option<u8>,
}

impl SimPort {
    /// Time the clock needs to move `bytes` at the current frequency.
    async fn clock(&self, bytes: usize) {
        let micros = (bytes as u64 * 8 * 1_000_000)
            / u64::from(self.frequency.max(1));
        if micros > 0 {
            Timer::after(Duration::from_micros(micros)).await;
        }
    }

    /// What a card puts on MISO after a command frame or a data block.
    fn respond(&mut self, words: &mut [u8]) {
        words.fill(0xFF);
        if words.is_empty() {
            return;
        }
        if let Some(token) = self.data_response.take() {
            words[0] = token;
            return;
        }
        let Some((command, argument)) = self.pending_command.take() else {
            return;
        };
        match command {
            CMD_GO_IDLE => {
                if !self.wire.take_init_failure() {
                    words[0] = R1_IDLE;
                }
            }
            CMD_SEND_CID => {
                words[0] = R1_READY;
                if words.len() >= 2 + CID.len() {
                    words[1] = DATA_TOKEN;
                    words[2..2 + CID.len()].copy_from_slice(&CID);
                }
            }
            CMD_READ_BLOCK => {
                words[0] = R1_READY;
                if words.len() >= 2 + BLOCK_LEN {
                    words[1] = DATA_TOKEN;
                    words[2..2 + BLOCK_LEN]
                        .copy_from_slice(&self.wire.load(argument));
                }
            }
            _ => words[0] = R1_READY,
        }
    }

    fn observe_write(&mut self, words: &[u8]) {
        if let Some(block) = self.pending_block.take() {
            if words.len() == BLOCK_LEN + 3 && words[0] == DATA_TOKEN {
                let token = if self.wire.take_write_failure() {
                    DATA_CRC_ERROR
                } else {
                    self.wire.store(block, &words[1..=BLOCK_LEN]);
                    DATA_ACCEPTED
                };
                self.data_response = Some(token);
                return;
            }
        }
        if words.len() == COMMAND_LEN && words[0] & 0xC0 == 0x40 {
            let command = words[0] & 0x3F;
            let argument =
                u32::from_be_bytes([words[1], words[2], words[3], words[4]]);
            self.pending_command = Some((command, argument));
            if command == CMD_WRITE_BLOCK {
                self.pending_block = Some(argument);
            }
        }
    }
}

impl ErrorType for SimPort {
    type Error = Infallible;
}

impl SpiBus for SimPort {
    async fn read(&mut self, words: &mut [u8]) -> Result<(), Infallible> {
        self.clock(words.len()).await;
        self.respond(words);
        self.wire.count(self.selected, 0, words.len());
        Ok(())
    }

    async fn write(&mut self, words: &[u8]) -> Result<(), Infallible> {
        self.clock(words.len()).await;
        self.observe_write(words);
        self.wire.count(self.selected, words.len(), 0);
        Ok(())
    }

    async fn transfer(
        &mut self,
        read: &mut [u8],
        write: &[u8],
    ) -> Result<(), Infallible> {
        self.clock(read.len().max(write.len())).await;
        self.observe_write(write);
        self.respond(read);
        self.wire.count(self.selected, write.len(), read.len());
        Ok(())
    }

    async fn transfer_in_place(
        &mut self,
        words: &mut [u8],
    ) -> Result<(), Infallible> {
        self.clock(words.len()).await;
        self.wire.count(self.selected, words.len(), words.len());
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), Infallible> {
        Ok(())
    }
}

impl SpiPort for SimPort {
    fn apply(&mut self, device: &DeviceConfig) -> Result<(), Infallible> {
        if self.frequency != device.frequency {
            trace!(host = self.host, hz = device.frequency, "retune clock");
        }
        self.frequency = device.frequency;
        Ok(())
    }

    fn select(&mut self, line: u8) -> Result<(), Infallible> {
        self.wire.select(line);
        self.selected = Some(line);
        Ok(())
    }

    fn deselect(&mut self, line: u8) -> Result<(), Infallible> {
        self.wire.deselect(line);
        self.selected = None;
        self.pending_command = None;
        self.pending_block = None;
        self.data_response = None;
        Ok(())
    }
}

pub struct SimResources {
    pub wire: Arc<Wire>,
}

pub struct SimDestructor {
    wire: Arc<Wire>,
}

/// Factory for the simulated peripheral.
pub struct SimFactory;

impl BusFactory for SimFactory {
    type Port = SimPort;
    type Resources = SimResources;
    type Destructor = SimDestructor;
    type Error = Infallible;

    fn create(
        resources: Self::Resources,
        bus: &BusHandle,
    ) -> Result<(Self::Port, Self::Destructor), (Self::Error, Self::Resources)>
    {
        debug!(
            host = bus.host(),
            pins = ?bus.pins(),
            dma = ?bus.dma_channel(),
            max_transfer = bus.max_transfer_size(),
            "bringing up spi host"
        );
        let port = SimPort {
            host: bus.host(),
            wire: resources.wire.clone(),
            selected: None,
            frequency: bus.max_frequency(),
            pending_command: None,
            pending_block: None,
            data_response: None,
        };
        Ok((port, SimDestructor { wire: resources.wire }))
    }

    fn recover(destructor: Self::Destructor) -> Self::Resources {
        debug!("spi host released");
        SimResources { wire: destructor.wire }
    }
}
