#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_time::Duration;
use embedded_hal::spi::{ErrorKind, ErrorType, Mode, MODE_0, MODE_3};
use embedded_hal_async::spi::SpiBus;
use spi_arbiter::{
    BusArbiter, BusFactory, BusHandle, BusPins, DeviceConfig, DeviceSession,
    SpiPort,
};

// ---------------------------------------------------------------------------
// Mock port
// ---------------------------------------------------------------------------

/// Everything the mock port did, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Apply { chip_select: u8, frequency: u32, mode: Mode },
    Select(u8),
    Deselect(u8),
    Read(usize),
    Write(Vec<u8>),
    Transfer { read: usize, write: usize },
    TransferInPlace(usize),
    Flush,
}

/// Shared view into the mock hardware, kept alive across create/recover.
#[derive(Default)]
pub struct Probe {
    pub create_count: AtomicUsize,
    pub recover_count: AtomicUsize,
    /// If set, the next `create` call fails.
    pub fail_next: AtomicBool,
    /// If set, every read/write fails.
    pub fail_io: AtomicBool,
    /// Chip-selects currently asserted.
    pub selected: AtomicUsize,
    /// Set if two chip-selects were ever asserted together.
    pub contention: AtomicBool,
    ops: Mutex<Vec<Op>>,
}

impl Probe {
    pub fn ops(&self) -> Vec<Op> {
        self.ops.lock().unwrap().clone()
    }

    pub fn clear_ops(&self) {
        self.ops.lock().unwrap().clear();
    }

    fn push(&self, op: Op) {
        self.ops.lock().unwrap().push(op);
    }

    fn io(&self, op: Op) -> Result<(), MockSpiError> {
        if self.fail_io.load(Ordering::SeqCst) {
            return Err(MockSpiError);
        }
        self.push(op);
        Ok(())
    }
}

#[derive(Debug, PartialEq)]
pub struct MockSpiError;

impl embedded_hal::spi::Error for MockSpiError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Other
    }
}

pub struct MockPort {
    probe: Arc<Probe>,
}

impl ErrorType for MockPort {
    type Error = MockSpiError;
}

impl SpiBus for MockPort {
    async fn read(&mut self, words: &mut [u8]) -> Result<(), MockSpiError> {
        words.fill(0xA5);
        self.probe.io(Op::Read(words.len()))
    }

    async fn write(&mut self, words: &[u8]) -> Result<(), MockSpiError> {
        self.probe.io(Op::Write(words.to_vec()))
    }

    async fn transfer(
        &mut self,
        read: &mut [u8],
        write: &[u8],
    ) -> Result<(), MockSpiError> {
        let n = read.len().min(write.len());
        read[..n].copy_from_slice(&write[..n]);
        self.probe.io(Op::Transfer { read: read.len(), write: write.len() })
    }

    async fn transfer_in_place(
        &mut self,
        words: &mut [u8],
    ) -> Result<(), MockSpiError> {
        // Loopback: MISO mirrors MOSI.
        self.probe.io(Op::TransferInPlace(words.len()))
    }

    async fn flush(&mut self) -> Result<(), MockSpiError> {
        self.probe.push(Op::Flush);
        Ok(())
    }
}

impl SpiPort for MockPort {
    fn apply(&mut self, device: &DeviceConfig) -> Result<(), MockSpiError> {
        self.probe.push(Op::Apply {
            chip_select: device.chip_select,
            frequency: device.frequency,
            mode: device.mode,
        });
        Ok(())
    }

    fn select(&mut self, line: u8) -> Result<(), MockSpiError> {
        if self.probe.selected.fetch_add(1, Ordering::SeqCst) != 0 {
            self.probe.contention.store(true, Ordering::SeqCst);
        }
        self.probe.push(Op::Select(line));
        Ok(())
    }

    fn deselect(&mut self, line: u8) -> Result<(), MockSpiError> {
        self.probe.selected.fetch_sub(1, Ordering::SeqCst);
        self.probe.push(Op::Deselect(line));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Mock factory
// ---------------------------------------------------------------------------

pub struct MockResources {
    probe: Arc<Probe>,
}

/// Holds the probe so resources can be recovered.
pub struct MockDestructor {
    probe: Arc<Probe>,
}

pub struct MockFactory;

#[derive(Debug, PartialEq)]
pub struct MockError;

impl BusFactory for MockFactory {
    type Port = MockPort;
    type Resources = MockResources;
    type Destructor = MockDestructor;
    type Error = MockError;

    fn create(
        resources: Self::Resources,
        _bus: &BusHandle,
    ) -> Result<(Self::Port, Self::Destructor), (Self::Error, Self::Resources)>
    {
        resources.probe.create_count.fetch_add(1, Ordering::SeqCst);
        if resources.probe.fail_next.swap(false, Ordering::SeqCst) {
            return Err((MockError, resources));
        }
        let port = MockPort { probe: resources.probe.clone() };
        Ok((port, MockDestructor { probe: resources.probe }))
    }

    fn recover(destructor: Self::Destructor) -> Self::Resources {
        destructor.probe.recover_count.fetch_add(1, Ordering::SeqCst);
        MockResources { probe: destructor.probe }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub type Arbiter = BusArbiter<CriticalSectionRawMutex, MockFactory, 4>;

pub const CS_DISPLAY: u8 = 14;
pub const CS_STORAGE: u8 = 4;
pub const DISPLAY_HZ: u32 = 40_000_000;
pub const STORAGE_HZ: u32 = 20_000_000;
pub const FOREVER: Duration = Duration::from_secs(60);

pub fn pins() -> BusPins {
    BusPins { sclk: 18, miso: Some(19), mosi: Some(23) }
}

pub fn bus(max_transfer_size: usize) -> BusHandle {
    BusHandle::initialize(2, pins(), max_transfer_size, Some(2)).unwrap()
}

pub fn make_arbiter(max_transfer_size: usize) -> (Arbiter, Arc<Probe>) {
    let probe = Arc::new(Probe::default());
    let resources = MockResources { probe: probe.clone() };
    (Arbiter::new(bus(max_transfer_size), resources), probe)
}

pub fn display(arbiter: &Arbiter) -> DeviceSession {
    DeviceSession::register(arbiter, CS_DISPLAY, DISPLAY_HZ, MODE_0).unwrap()
}

pub fn storage(arbiter: &Arbiter) -> DeviceSession {
    DeviceSession::register(arbiter, CS_STORAGE, STORAGE_HZ, MODE_3).unwrap()
}
