//! ILI9341-style display driver that refreshes one band of the panel per
//! render tick.

use anyhow::{anyhow, Result};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Instant, Ticker};
use spi_arbiter::{ArbiterError, DeviceSession, Ticket, TransferRequest};
use tracing::{debug, info, warn};

use crate::Arbiter;

const CASET: u8 = 0x2A;
const RASET: u8 = 0x2B;
const RAMWR: u8 = 0x2C;

pub const WIDTH: u16 = 320;
pub const HEIGHT: u16 = 240;
/// Rows flushed per frame.
pub const BAND: u16 = 16;

const HEARTBEAT: Duration = Duration::from_secs(2);

pub struct Display<'a> {
    arbiter: &'a Arbiter,
    session: DeviceSession,
    acquire_timeout: Duration,
    frames: u32,
    skipped: u32,
    pixels: Vec<u8>,
}

impl<'a> Display<'a> {
    pub fn new(
        arbiter: &'a Arbiter,
        session: DeviceSession,
        acquire_timeout: Duration,
    ) -> Self {
        Self {
            arbiter,
            session,
            acquire_timeout,
            frames: 0,
            skipped: 0,
            pixels: vec![0; usize::from(WIDTH) * usize::from(BAND) * 2],
        }
    }

    /// Frames flushed to the panel.
    pub fn frames(&self) -> u32 {
        self.frames
    }

    /// Frames dropped because the bus stayed busy past the timeout.
    pub fn skipped(&self) -> u32 {
        self.skipped
    }

    /// Render on every tick of `interval` until `stop` is signalled.
    pub async fn run(
        &mut self,
        interval: Duration,
        stop: &Signal<CriticalSectionRawMutex, ()>,
    ) -> Result<()> {
        let mut ticker = Ticker::every(interval);
        let mut heartbeat = Instant::now();
        loop {
            tokio::select! {
                _ = ticker.next() => {}
                _ = stop.wait() => break,
            }
            self.frame().await?;

            if heartbeat.elapsed() >= HEARTBEAT {
                info!(frames = self.frames, "display task still ticks");
                heartbeat = Instant::now();
            }
        }
        debug!(frames = self.frames, skipped = self.skipped, "display stopped");
        Ok(())
    }

    /// Flush the next band, or skip it if the bus cannot be had in time.
    pub async fn frame(&mut self) -> Result<()> {
        let ticket = match self
            .arbiter
            .acquire(&self.session, self.acquire_timeout)
            .await
        {
            Ok(ticket) => ticket,
            Err(ArbiterError::Timeout) => {
                self.skipped += 1;
                warn!(frame = self.frames, "bus busy, frame skipped");
                return Ok(());
            }
            Err(err) => return Err(anyhow!("display acquire failed: {err:?}")),
        };

        let flushed = self.flush(&ticket).await;
        self.arbiter
            .release(ticket)
            .map_err(|err| anyhow!("display release failed: {err:?}"))?;
        flushed?;
        self.frames += 1;
        Ok(())
    }

    async fn flush(&mut self, ticket: &Ticket) -> Result<()> {
        let band = self.frames % u32::from(HEIGHT / BAND);
        let top = band as u16 * BAND;
        let bottom = top + BAND - 1;
        paint(&mut self.pixels, self.frames);

        let [x0h, x0l] = 0u16.to_be_bytes();
        let [x1h, x1l] = (WIDTH - 1).to_be_bytes();
        let [y0h, y0l] = top.to_be_bytes();
        let [y1h, y1l] = bottom.to_be_bytes();

        let executor = self.arbiter.executor(&self.session);
        executor
            .transaction(
                ticket,
                &mut [
                    TransferRequest::Write(&[CASET]),
                    TransferRequest::Write(&[x0h, x0l, x1h, x1l]),
                    TransferRequest::Write(&[RASET]),
                    TransferRequest::Write(&[y0h, y0l, y1h, y1l]),
                    TransferRequest::Write(&[RAMWR]),
                ],
            )
            .await
            .map_err(|err| anyhow!("address window: {err:?}"))?;

        let chunk = self.arbiter.bus().max_transfer_size();
        for part in self.pixels.chunks(chunk) {
            executor
                .transfer(ticket, TransferRequest::Write(part))
                .await
                .map_err(|err| anyhow!("pixel data: {err:?}"))?;
        }
        Ok(())
    }
}

/// Fill `pixels` with an RGB565 gradient that drifts every frame.
fn paint(pixels: &mut [u8], frame: u32) {
    for (i, px) in pixels.chunks_exact_mut(2).enumerate() {
        let x = (i % usize::from(WIDTH)) as u32;
        let r = x.wrapping_add(frame) & 0x1F;
        let g = (x / 2).wrapping_add(frame.wrapping_mul(3)) & 0x3F;
        let b = frame & 0x1F;
        let rgb565 = (r << 11 | g << 5 | b) as u16;
        px.copy_from_slice(&rgb565.to_be_bytes());
    }
}
