#![no_std]
//! FIFO arbitration of one SPI bus shared by several device drivers.
//!
//! A display controller and an SD card on the same bus must never drive it
//! at the same time. Each driver registers a [`DeviceSession`], acquires the
//! bus through the [`BusArbiter`] to obtain a [`Ticket`], issues any number
//! of transfers through a [`TransferExecutor`], and releases the ticket.
//! Waiters are served in arrival order and suspend instead of spinning.
//!
//! The hardware port is only created when first acquired, through a
//! platform supplied [`BusFactory`].

mod arbiter;
mod bus;
mod error;
mod executor;
mod factory;
mod session;
mod watchdog;

pub use arbiter::{ArbiterStats, BusArbiter, Ticket};
pub use bus::{BusHandle, BusPins};
pub use error::{ArbiterError, ConfigError};
pub use executor::{Direction, TransferExecutor, TransferRequest};
pub use factory::{BusFactory, SpiPort};
pub use session::{DeviceConfig, DeviceSession, SessionId};
pub use watchdog::{BusObserver, StuckBus};
