use embedded_hal_async::spi::SpiBus;

use crate::bus::BusHandle;
use crate::session::DeviceConfig;

/// Hardware side of a shared bus.
///
/// On top of the raw byte operations of [`SpiBus`], a port knows how to
/// retune itself for a device and how to drive each device's chip-select
/// line. The arbiter only calls these while a ticket is held, so
/// implementations never see two devices selected at once.
pub trait SpiPort: SpiBus<u8> {
    /// Apply the clock and mode of `device` before its transaction.
    fn apply(&mut self, device: &DeviceConfig) -> Result<(), Self::Error>;

    /// Drive the chip-select `line` active.
    fn select(&mut self, line: u8) -> Result<(), Self::Error>;

    /// Release the chip-select `line`.
    fn deselect(&mut self, line: u8) -> Result<(), Self::Error>;
}

/// Brings the hardware port up on first grant and takes it down again.
///
/// The arbiter holds `Resources` while the bus is idle and a `Destructor`
/// while the port exists, so the peripheral can be handed back and forth
/// without ever being duplicated.
pub trait BusFactory {
    type Port: SpiPort;
    /// Peripheral, pins and DMA channel the port is built from.
    type Resources;
    /// Turns back into [`Resources`](Self::Resources) once the port is gone.
    type Destructor;
    type Error: core::fmt::Debug;

    /// Configure the peripheral described by `bus`.
    ///
    /// A failed attempt returns `resources` with the error so the next
    /// grant can try again.
    fn create(
        resources: Self::Resources,
        bus: &BusHandle,
    ) -> Result<(Self::Port, Self::Destructor), (Self::Error, Self::Resources)>;

    fn recover(destructor: Self::Destructor) -> Self::Resources;
}
