use std::future::Future;
use std::time::Duration;

use block_ingest_common::StoredBlock;
use futures::{Stream, StreamExt as _};
use serde_json::Value;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

use super::{Destination, Hysteresis, SinkError, Watermarks};
use crate::archive::{ArchiveError, ArchiveItem};

struct Slot {
    destination: Box<dyn Destination>,
    committed: Option<u64>,
    rows: Vec<Value>,
    /// Highest block whose rows are in `rows`.
    through: Option<u64>,
}

impl Slot {
    fn has_pending(&self) -> bool {
        self.through > self.committed
    }
}

/// Feeds archived blocks to a fixed set of destinations that share one
/// buffered row limit.
pub struct SinkPipeline {
    slots: Vec<Slot>,
    gate: Hysteresis,
    flush_interval: Duration,
}

impl SinkPipeline {
    pub async fn new(
        destinations: Vec<Box<dyn Destination>>,
        watermarks: Watermarks,
        flush_interval: Duration,
    ) -> Result<Self, SinkError> {
        let mut slots = Vec::with_capacity(destinations.len());
        for mut destination in destinations {
            let committed = destination.committed_block().await?;
            info!(
                destination = destination.name(),
                committed_block = ?committed,
                "opened destination"
            );
            slots.push(Slot {
                destination,
                committed,
                rows: Vec::new(),
                through: None,
            });
        }
        Ok(Self {
            slots,
            gate: Hysteresis::new(watermarks),
            flush_interval,
        })
    }

    /// First block some destination still needs: one past the slowest
    /// destination's committed block, or `first_block` if one has nothing.
    pub fn resume_block(&self, first_block: u64) -> u64 {
        self.slots
            .iter()
            .map(|slot| slot.committed.map_or(first_block, |n| n + 1))
            .min()
            .unwrap_or(first_block)
    }

    /// Last block committed by every destination.
    pub fn committed_block(&self) -> Option<u64> {
        self.slots
            .iter()
            .map(|slot| slot.committed)
            .min()
            .flatten()
    }

    pub fn buffered_rows(&self) -> usize {
        self.gate.buffered()
    }

    pub fn is_paused(&self) -> bool {
        self.gate.is_paused()
    }

    /// Consumes `blocks` to the end, then writes out everything buffered.
    pub async fn run<S>(&mut self, blocks: S) -> Result<Option<u64>, SinkError>
    where
        S: Stream<Item = Result<ArchiveItem, ArchiveError>>,
    {
        self.run_until(blocks, std::future::pending()).await
    }

    /// Like [`Self::run`], but stops reading once `shutdown` resolves. The
    /// signal is only observed between blocks, never during a write.
    pub async fn run_until<S>(
        &mut self,
        blocks: S,
        shutdown: impl Future<Output = ()>,
    ) -> Result<Option<u64>, SinkError>
    where
        S: Stream<Item = Result<ArchiveItem, ArchiveError>>,
    {
        futures::pin_mut!(blocks);
        tokio::pin!(shutdown);
        let mut ticker = interval_at(Instant::now() + self.flush_interval, self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = &mut shutdown => {
                    info!("stopping export");
                    break;
                }
                item = blocks.next() => {
                    let Some(item) = item else { break };
                    self.push(&item?.block)?;
                    if self.gate.is_paused() {
                        debug!(buffered = self.gate.buffered(), "buffers full, pausing reader");
                        self.drain_to_low_watermark().await?;
                    }
                }
                _ = ticker.tick() => self.flush_all().await?,
            }
        }

        self.flush_all().await?;
        Ok(self.committed_block())
    }

    /// Buffers the rows of one block for every destination that has not
    /// committed it yet.
    pub fn push(&mut self, block: &StoredBlock) -> Result<(), SinkError> {
        let number = block.number();
        for slot in &mut self.slots {
            if slot.committed.is_some_and(|committed| number <= committed) {
                continue;
            }
            let rows = slot.destination.encode(block)?;
            self.gate.record_added(rows.len());
            slot.rows.extend(rows);
            slot.through = Some(number);
        }
        Ok(())
    }

    /// Writes the largest buffers until the gate reopens.
    pub async fn drain_to_low_watermark(&mut self) -> Result<(), SinkError> {
        while self.gate.is_paused() {
            let Some(index) = self
                .slots
                .iter()
                .enumerate()
                .filter(|(_, slot)| slot.has_pending())
                .max_by_key(|(_, slot)| slot.rows.len())
                .map(|(index, _)| index)
            else {
                break;
            };
            self.flush_slot(index).await?;
        }
        Ok(())
    }

    pub async fn flush_all(&mut self) -> Result<(), SinkError> {
        for index in 0..self.slots.len() {
            self.flush_slot(index).await?;
        }
        Ok(())
    }

    async fn flush_slot(&mut self, index: usize) -> Result<(), SinkError> {
        let slot = &mut self.slots[index];
        let Some(through) = slot.through.filter(|_| slot.has_pending()) else {
            return Ok(());
        };
        // The buffer stays put until the write lands, so a failed or dropped
        // write is retried with the same rows.
        let count = slot.rows.len();
        slot.destination.write(slot.rows.clone(), through).await?;
        slot.rows.clear();
        slot.committed = Some(through);
        self.gate.record_released(count);
        debug!(
            destination = slot.destination.name(),
            rows = count,
            through_block = through,
            "flushed destination"
        );
        Ok(())
    }
}
