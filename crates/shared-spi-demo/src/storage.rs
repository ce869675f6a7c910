//! SD card driver speaking the SPI-mode command protocol.
//!
//! Only single-block reads and writes go over the bus. The file table is a
//! [`Catalog`] held on the host; the card stores nothing but file blocks.

use std::collections::BTreeMap;

use anyhow::{anyhow, bail, ensure, Result};
use embassy_time::{Duration, Timer};
use spi_arbiter::{ArbiterError, DeviceSession, Ticket, TransferRequest};
use tracing::{debug, info, warn};

use crate::sim::{
    BLOCK_LEN, CMD_GO_IDLE, CMD_READ_BLOCK, CMD_SEND_CID, CMD_WRITE_BLOCK,
    COMMAND_LEN, DATA_ACCEPTED, DATA_TOKEN, R1_IDLE, R1_READY,
};
use crate::Arbiter;

pub const MOUNT_ATTEMPTS: u32 = 5;
/// Timed out acquisitions retried before an operation gives up.
pub const ACQUIRE_RETRIES: u32 = 10;
/// Longest line returned by [`Storage::read_line`], newline included.
pub const LINE_MAX: usize = 63;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry {
    block: u32,
    len: usize,
}

impl Entry {
    fn blocks(&self) -> u32 {
        self.len.div_ceil(BLOCK_LEN).max(1) as u32
    }
}

/// Where each file lives on the card.
///
/// Survives [`Storage::unmount`] so a later mount of the same card can
/// find its files again.
#[derive(Debug, Default)]
pub struct Catalog {
    files: BTreeMap<String, Entry>,
}

impl Catalog {
    /// Number of files.
    pub fn count(&self) -> usize {
        self.files.len()
    }

    /// First block past every file, old copies included.
    fn next_free(&self) -> u32 {
        self.files.values().map(|e| e.block + e.blocks()).max().unwrap_or(0)
    }
}

pub struct Storage<'a> {
    arbiter: &'a Arbiter,
    session: DeviceSession,
    acquire_timeout: Duration,
    retry_delay: Duration,
    catalog: Catalog,
    /// Product name of the mounted card.
    card: Option<String>,
}

impl<'a> Storage<'a> {
    pub fn new(
        arbiter: &'a Arbiter,
        session: DeviceSession,
        acquire_timeout: Duration,
    ) -> Self {
        Self {
            arbiter,
            session,
            acquire_timeout,
            retry_delay: Duration::from_secs(1),
            catalog: Catalog::default(),
            card: None,
        }
    }

    /// Pause between card initialization attempts.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Start from the catalog an earlier [`Storage::unmount`] returned.
    pub fn with_catalog(mut self, catalog: Catalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// Initialize the card, retrying a few times.
    pub async fn mount(&mut self) -> Result<&str> {
        let mut attempt = 1;
        let card = loop {
            match self.init_card().await {
                Ok(name) => break name,
                Err(err) if attempt < MOUNT_ATTEMPTS => {
                    warn!(attempt, "card init failed: {err:#}");
                    attempt += 1;
                    Timer::after(self.retry_delay).await;
                }
                Err(err) => {
                    return Err(err.context(format!(
                        "card did not initialize after {MOUNT_ATTEMPTS} attempts"
                    )))
                }
            }
        };
        info!(card = %card, files = self.catalog.count(), "card mounted");
        Ok(self.card.insert(card).as_str())
    }

    pub fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.files()?.contains_key(name))
    }

    /// Create or truncate `name` and fill it with `contents`.
    ///
    /// The old contents stay reachable until every new block is written.
    pub async fn write_file(
        &mut self,
        name: &str,
        contents: &[u8],
    ) -> Result<()> {
        ensure!(self.card.is_some(), "card is not mounted");
        let entry = Entry {
            block: self.catalog.next_free(),
            len: contents.len(),
        };

        for (i, chunk) in contents.chunks(BLOCK_LEN).enumerate() {
            let mut block = [0; BLOCK_LEN];
            block[..chunk.len()].copy_from_slice(chunk);
            self.write_block(entry.block + i as u32, &block).await?;
        }
        self.files_mut()?.insert(name.to_owned(), entry);
        debug!(
            file = name,
            bytes = contents.len(),
            block = entry.block,
            "file written"
        );
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Result<()> {
        if self.files_mut()?.remove(name).is_none() {
            bail!("{name}: no such file");
        }
        Ok(())
    }

    /// Rename `from` to `to`. Fails if `to` already exists.
    pub fn rename(&mut self, from: &str, to: &str) -> Result<()> {
        let files = self.files_mut()?;
        ensure!(!files.contains_key(to), "{to}: file exists");
        let entry = files
            .remove(from)
            .ok_or_else(|| anyhow!("{from}: no such file"))?;
        files.insert(to.to_owned(), entry);
        Ok(())
    }

    /// First line of `name` without its newline, at most [`LINE_MAX`] bytes.
    pub async fn read_line(&self, name: &str) -> Result<String> {
        let entry = *self
            .files()?
            .get(name)
            .ok_or_else(|| anyhow!("{name}: no such file"))?;

        let limit = entry.len.min(LINE_MAX);
        let mut line = Vec::with_capacity(limit);
        let mut block = entry.block;
        while line.len() < limit && !line.contains(&b'\n') {
            let data = self.read_block(block).await?;
            let take = (limit - line.len()).min(BLOCK_LEN);
            line.extend_from_slice(&data[..take]);
            block += 1;
        }

        if let Some(newline) = line.iter().position(|&b| b == b'\n') {
            line.truncate(newline);
        }
        Ok(String::from_utf8_lossy(&line).into_owned())
    }

    /// Detach from the bus and power the port down if nobody else is on it.
    /// Returns the catalog for the next mount.
    pub async fn unmount(mut self) -> Result<Catalog> {
        if self.card.take().is_none() {
            bail!("card is not mounted");
        }
        self.arbiter
            .deregister(self.session)
            .map_err(|(err, _)| anyhow!("deregister failed: {err:?}"))?;

        match self.arbiter.deactivate().await {
            Ok(()) => info!("card unmounted, spi host released"),
            Err(ArbiterError::InUse) => {
                info!("card unmounted, spi host still in use")
            }
            Err(err) => bail!("deactivate failed: {err:?}"),
        }
        Ok(self.catalog)
    }

    fn files(&self) -> Result<&BTreeMap<String, Entry>> {
        ensure!(self.card.is_some(), "card is not mounted");
        Ok(&self.catalog.files)
    }

    fn files_mut(&mut self) -> Result<&mut BTreeMap<String, Entry>> {
        ensure!(self.card.is_some(), "card is not mounted");
        Ok(&mut self.catalog.files)
    }

    /// Reset the card and read its product name.
    async fn init_card(&self) -> Result<String> {
        let ticket = self.acquire().await?;
        let result = self.identify(&ticket).await;
        self.release(ticket)?;
        result
    }

    async fn identify(&self, ticket: &Ticket) -> Result<String> {
        let mut r1 = [0u8; 1];
        self.command(ticket, CMD_GO_IDLE, 0, &mut r1).await?;
        ensure!(r1[0] == R1_IDLE, "no idle response (r1 {:#04x})", r1[0]);

        let mut cid = [0u8; 20];
        self.command(ticket, CMD_SEND_CID, 0, &mut cid).await?;
        ensure!(
            cid[0] == R1_READY && cid[1] == DATA_TOKEN,
            "CID read rejected (r1 {:#04x})",
            cid[0]
        );
        // Product name sits at bytes 3..8 of the register.
        let name = String::from_utf8_lossy(&cid[5..10]);
        Ok(name.trim_end().to_owned())
    }

    async fn read_block(&self, block: u32) -> Result<[u8; BLOCK_LEN]> {
        let ticket = self.acquire().await?;
        let mut response = [0u8; BLOCK_LEN + 4];
        let result = self
            .command(&ticket, CMD_READ_BLOCK, block, &mut response)
            .await;
        self.release(ticket)?;
        result?;

        ensure!(
            response[0] == R1_READY && response[1] == DATA_TOKEN,
            "read of block {block} rejected (r1 {:#04x})",
            response[0]
        );
        let mut data = [0; BLOCK_LEN];
        data.copy_from_slice(&response[2..2 + BLOCK_LEN]);
        Ok(data)
    }

    async fn write_block(
        &self,
        block: u32,
        data: &[u8; BLOCK_LEN],
    ) -> Result<()> {
        let frame = command_frame(CMD_WRITE_BLOCK, block);
        let mut packet = [0xFF; BLOCK_LEN + 3];
        packet[0] = DATA_TOKEN;
        packet[1..=BLOCK_LEN].copy_from_slice(data);
        let mut r1 = [0u8; 1];
        let mut accepted = [0u8; 1];

        let ticket = self.acquire().await?;
        let result = self
            .arbiter
            .executor(&self.session)
            .transaction(
                &ticket,
                &mut [
                    TransferRequest::Write(&frame),
                    TransferRequest::Read(&mut r1),
                    TransferRequest::Write(&packet),
                    TransferRequest::Read(&mut accepted),
                ],
            )
            .await;
        self.release(ticket)?;
        result.map_err(|err| anyhow!("write of block {block}: {err:?}"))?;

        ensure!(r1[0] == R1_READY, "write of block {block} rejected");
        ensure!(
            accepted[0] & 0x1F == DATA_ACCEPTED,
            "card refused data for block {block}"
        );
        Ok(())
    }

    /// Send one command frame and clock in `response` under one select.
    async fn command(
        &self,
        ticket: &Ticket,
        command: u8,
        argument: u32,
        response: &mut [u8],
    ) -> Result<()> {
        let frame = command_frame(command, argument);
        self.arbiter
            .executor(&self.session)
            .transaction(
                ticket,
                &mut [
                    TransferRequest::Write(&frame),
                    TransferRequest::Read(response),
                ],
            )
            .await
            .map_err(|err| anyhow!("CMD{command}: {err:?}"))?;
        Ok(())
    }

    async fn acquire(&self) -> Result<Ticket> {
        let mut retries = 0;
        loop {
            match self
                .arbiter
                .acquire(&self.session, self.acquire_timeout)
                .await
            {
                Ok(ticket) => return Ok(ticket),
                Err(ArbiterError::Timeout) if retries < ACQUIRE_RETRIES => {
                    retries += 1;
                    debug!(retries, "bus busy, retrying");
                }
                Err(err) => bail!("card acquire failed: {err:?}"),
            }
        }
    }

    fn release(&self, ticket: Ticket) -> Result<()> {
        self.arbiter
            .release(ticket)
            .map_err(|err| anyhow!("card release failed: {err:?}"))
    }
}

fn command_frame(command: u8, argument: u32) -> [u8; COMMAND_LEN] {
    let [a, b, c, d] = argument.to_be_bytes();
    // Only CMD0 is checked before CRC is switched off.
    let crc = if command == CMD_GO_IDLE { 0x95 } else { 0x01 };
    [0x40 | command, a, b, c, d, crc]
}
