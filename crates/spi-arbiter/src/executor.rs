use embassy_sync::blocking_mutex::raw::RawMutex;

use crate::arbiter::{BusArbiter, Ticket};
use crate::error::ArbiterError;
use crate::factory::{BusFactory, SpiPort};
use crate::session::{DeviceConfig, DeviceSession, SessionId};

/// Which way the bytes of a [`TransferRequest`] move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Direction {
    Read,
    Write,
    FullDuplex,
}

/// One SPI operation and the buffers it reads from or writes into.
#[derive(Debug, PartialEq, Eq)]
pub enum TransferRequest<'a> {
    /// Clock in `buf.len()` bytes.
    Read(&'a mut [u8]),
    /// Clock out the whole buffer, discarding what comes back.
    Write(&'a [u8]),
    /// Clock out `write` while clocking in `read`. The longer buffer sets
    /// the length.
    FullDuplex { read: &'a mut [u8], write: &'a [u8] },
    /// Clock out the buffer and overwrite it with what comes back.
    InPlace(&'a mut [u8]),
}

impl TransferRequest<'_> {
    pub fn direction(&self) -> Direction {
        match self {
            Self::Read(_) => Direction::Read,
            Self::Write(_) => Direction::Write,
            Self::FullDuplex { .. } | Self::InPlace(_) => Direction::FullDuplex,
        }
    }

    /// Bytes clocked on the bus by this request.
    pub fn len(&self) -> usize {
        match self {
            Self::Read(buf) => buf.len(),
            Self::Write(buf) => buf.len(),
            Self::FullDuplex { read, write } => read.len().max(write.len()),
            Self::InPlace(buf) => buf.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Runs transactions for one session under a ticket it already holds.
///
/// The executor never acquires or releases the bus itself, so a driver can
/// issue several transfers back to back within one acquisition.
pub struct TransferExecutor<'a, M: RawMutex, F: BusFactory, const N: usize> {
    arbiter: &'a BusArbiter<M, F, N>,
    session: SessionId,
    config: DeviceConfig,
}

impl<M: RawMutex, F: BusFactory, const N: usize> BusArbiter<M, F, N> {
    /// Executor targeting `session` on this bus.
    pub fn executor(
        &self,
        session: &DeviceSession,
    ) -> TransferExecutor<'_, M, F, N> {
        TransferExecutor {
            arbiter: self,
            session: session.id(),
            config: *session.config(),
        }
    }
}

impl<'a, M: RawMutex, F: BusFactory, const N: usize>
    TransferExecutor<'a, M, F, N>
{
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Perform one chip-select framed transfer and return the bytes moved.
    pub async fn transfer(
        &self,
        ticket: &Ticket,
        request: TransferRequest<'_>,
    ) -> Result<usize, ArbiterError<F::Error>> {
        self.transaction(ticket, &mut [request]).await
    }

    /// Perform several requests under a single chip-select assertion.
    ///
    /// Every request is checked against the bus limit before the port is
    /// touched; returns the total bytes moved.
    pub async fn transaction(
        &self,
        ticket: &Ticket,
        requests: &mut [TransferRequest<'_>],
    ) -> Result<usize, ArbiterError<F::Error>> {
        self.arbiter.validate(ticket, self.session)?;

        let max = self.arbiter.bus().max_transfer_size();
        if let Some(oversized) = requests.iter().find(|r| r.len() > max) {
            return Err(ArbiterError::TransferSize {
                requested: oversized.len(),
                max,
            });
        }

        let mut phase = self.arbiter.lock_port().await;
        // The ticket may have been released while the port was busy.
        self.arbiter.validate(ticket, self.session)?;
        let port = BusArbiter::<M, F, N>::ensure_active(
            &mut phase,
            self.arbiter.bus(),
        )?;

        port.apply(&self.config).map_err(bus_error)?;
        port.select(self.config.chip_select).map_err(bus_error)?;

        let result = run(port, requests).await;
        // Deselect even if the transfer failed so the bus is left idle.
        let deselect = port.deselect(self.config.chip_select);

        let moved = result.map_err(bus_error)?;
        deselect.map_err(bus_error)?;
        Ok(moved)
    }
}

async fn run<P: SpiPort>(
    port: &mut P,
    requests: &mut [TransferRequest<'_>],
) -> Result<usize, P::Error> {
    let mut moved = 0;
    for request in requests.iter_mut() {
        match request {
            TransferRequest::Read(buf) => port.read(buf).await?,
            TransferRequest::Write(buf) => port.write(buf).await?,
            TransferRequest::FullDuplex { read, write } => {
                port.transfer(read, write).await?
            }
            TransferRequest::InPlace(buf) => port.transfer_in_place(buf).await?,
        }
        moved += request.len();
    }
    port.flush().await?;
    Ok(moved)
}

fn bus_error<E: embedded_hal::spi::Error, F: core::fmt::Debug>(
    err: E,
) -> ArbiterError<F> {
    #[cfg(feature = "defmt")]
    defmt::warn!("spi transfer failed: {}", err.kind());
    ArbiterError::Bus(err.kind())
}
