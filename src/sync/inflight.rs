//! Requests waiting for their acknowledgment.

use std::{
    sync::{
        mpsc::{self, Receiver, RecvTimeoutError, SyncSender},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use fnv::FnvHashMap;
use tracing::{debug, trace, warn};

use crate::v3::{
    header::{ControlPacketType, PacketId},
    publish::PubAck,
    subscribe::SubAck,
    unsubscribe::UnsubAck,
};

use super::{error::ClientError, pkid::PacketIdAllocator};

/// Acknowledgment received for a pending request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Ack {
    PubAck(PubAck),
    SubAck(SubAck),
    UnsubAck(UnsubAck),
}

impl Ack {
    pub(crate) fn packet_type(&self) -> ControlPacketType {
        match self {
            Ack::PubAck(_) => ControlPacketType::PubAck,
            Ack::SubAck(_) => ControlPacketType::SubAck,
            Ack::UnsubAck(_) => ControlPacketType::UnsubAck,
        }
    }

    pub(crate) fn pkid(&self) -> PacketId {
        match self {
            Ack::PubAck(ack) => ack.pkid(),
            Ack::SubAck(ack) => ack.pkid(),
            Ack::UnsubAck(ack) => ack.pkid(),
        }
    }
}

#[derive(Debug)]
struct Slot {
    /// Type of the acknowledgment expected.
    packet_type: ControlPacketType,
    /// Distinguishes a reused identifier.
    generation: u64,
    tx: SyncSender<Ack>,
}

#[derive(Debug, Default)]
struct Table {
    alloc: PacketIdAllocator,
    generation: u64,
    pending: FnvHashMap<PacketId, Slot>,
}

/// Pending requests keyed by packet identifier.
#[derive(Debug, Default)]
pub(crate) struct Inflight {
    table: Mutex<Table>,
}

impl Inflight {
    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocates a free identifier and registers the request waiting for `packet_type`.
    ///
    /// The identifier is reserved before the request is sent, so the acknowledgment can't arrive
    /// before the slot exists.
    pub(crate) fn register(
        self: &Arc<Self>,
        packet_type: ControlPacketType,
    ) -> Result<Pending, ClientError> {
        let (tx, rx) = mpsc::sync_channel(1);

        let mut table = self.lock();
        let table = &mut *table;

        let pending = &table.pending;
        let pkid = table
            .alloc
            .next(|id| pending.contains_key(&id))
            .ok_or(ClientError::TooManyInflight)?;

        table.generation = table.generation.wrapping_add(1);
        let generation = table.generation;

        table.pending.insert(
            pkid,
            Slot {
                packet_type,
                generation,
                tx,
            },
        );

        trace!(%pkid, %packet_type, "registered pending request");

        Ok(Pending {
            pkid,
            generation,
            rx,
            inflight: Arc::clone(self),
            resolved: false,
        })
    }

    /// Hands the acknowledgment to its waiter.
    ///
    /// Returns `false` if no request was waiting for it.
    pub(crate) fn deliver(&self, ack: Ack) -> bool {
        let pkid = ack.pkid();
        let packet_type = ack.packet_type();

        let slot = {
            let mut table = self.lock();

            match table.pending.get(&pkid) {
                Some(slot) if slot.packet_type == packet_type => table.pending.remove(&pkid),
                _ => None,
            }
        };

        let Some(slot) = slot else {
            warn!(%pkid, %packet_type, "dropping unmatched acknowledgment");

            return false;
        };

        // The channel has space for the single value
        if slot.tx.try_send(ack).is_err() {
            debug!(%pkid, "waiter already gone");
        }

        true
    }

    /// Wakes every waiter with [`ClientError::ConnectionLost`].
    pub(crate) fn fail_all(&self) {
        let pending = std::mem::take(&mut self.lock().pending);

        if !pending.is_empty() {
            debug!(count = pending.len(), "failing pending requests");
        }

        // Dropping the senders disconnects the receivers
        drop(pending);
    }

    /// Removes the slot if it still belongs to the request.
    fn remove(&self, pkid: PacketId, generation: u64) -> bool {
        let mut table = self.lock();

        match table.pending.get(&pkid) {
            Some(slot) if slot.generation == generation => {
                table.pending.remove(&pkid);

                true
            }
            _ => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.lock().pending.len()
    }
}

/// A registered request, waiting for its acknowledgment.
///
/// Dropping it without waiting releases the identifier.
#[derive(Debug)]
pub(crate) struct Pending {
    pkid: PacketId,
    generation: u64,
    rx: Receiver<Ack>,
    inflight: Arc<Inflight>,
    resolved: bool,
}

impl Pending {
    pub(crate) fn pkid(&self) -> PacketId {
        self.pkid
    }

    /// Blocks until the acknowledgment is delivered or the timeout expires.
    pub(crate) fn wait(mut self, timeout: Duration) -> Result<Ack, ClientError> {
        let res = match self.rx.recv_timeout(timeout) {
            Ok(ack) => Ok(ack),
            Err(RecvTimeoutError::Timeout) => {
                if self.inflight.remove(self.pkid, self.generation) {
                    Err(ClientError::Timeout)
                } else {
                    // The delivery removed the slot first, the value is on its way
                    self.rx.recv().map_err(|_| ClientError::ConnectionLost)
                }
            }
            Err(RecvTimeoutError::Disconnected) => Err(ClientError::ConnectionLost),
        };

        self.resolved = true;

        res
    }
}

impl Drop for Pending {
    fn drop(&mut self) {
        if !self.resolved {
            self.inflight.remove(self.pkid, self.generation);
        }
    }
}
