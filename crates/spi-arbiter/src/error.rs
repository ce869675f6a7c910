use embedded_hal::spi::ErrorKind;

/// Static setup problems detected while describing a bus or registering a
/// device on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigError {
    /// A bus must be able to move at least one byte per transfer.
    ZeroTransferSize,
    /// A clock frequency of 0 Hz was requested.
    ZeroFrequency,
    /// Neither a data-in nor a data-out line was assigned.
    NoDataLine,
    /// The same GPIO was assigned to two bus lines.
    PinConflict { pin: u8 },
    /// The chip-select line is already taken by another device or by a bus line.
    ChipSelectConflict { line: u8 },
    /// The device clock exceeds what the bus is rated for.
    FrequencyTooHigh { requested: u32, max: u32 },
    /// The arbiter's session table is full.
    TooManySessions,
}

/// Errors that can occur while arbitrating or using the bus.
///
/// `E` is the error type of the [`BusFactory`](crate::BusFactory) that brings
/// the hardware up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ArbiterError<E: core::fmt::Debug> {
    /// Invalid static setup.
    Configuration(ConfigError),
    /// The bus could not be granted before the timeout elapsed.
    Timeout,
    /// The session already holds the bus or is already waiting for it.
    Reentrancy,
    /// The ticket is stale, foreign, or was never granted.
    InvalidTicket,
    /// The request is longer than the bus can move in one transfer.
    TransferSize { requested: usize, max: usize },
    /// The session was never registered with this arbiter.
    UnknownSession,
    /// The bus or session is currently in use.
    InUse,
    /// The bus factory failed to create the hardware port.
    Factory(E),
    /// The hardware port reported an error during a transfer.
    Bus(ErrorKind),
    /// The hardware port is in an unrecoverable state.
    Poisoned,
}

impl<E: core::fmt::Debug> From<ConfigError> for ArbiterError<E> {
    fn from(err: ConfigError) -> Self {
        Self::Configuration(err)
    }
}
