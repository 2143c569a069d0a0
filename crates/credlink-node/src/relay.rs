//! Round-robin relay of buffered payloads back to their senders.

use credlink_protocol::ConnectionTable;

use crate::link::LinkRequest;

/// Services at most one slot per pass, rotating fairly across the table.
///
/// The cursor points at the slot after the last one serviced, so every slot
/// with data and credit is reached within `capacity` passes.
#[derive(Debug, Clone, Default)]
pub struct RelayLoop {
    cursor: usize,
    sent: u64,
}

impl RelayLoop {
    pub fn new() -> Self {
        Self::default()
    }

    /// Position the next pass starts scanning from.
    #[must_use]
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Payloads relayed since creation.
    #[must_use]
    pub fn sent(&self) -> u64 {
        self.sent
    }

    /// Undo the count for a payload the link layer refused.
    pub fn retract(&mut self) {
        self.sent = self.sent.saturating_sub(1);
    }

    /// Run one relay pass.
    ///
    /// Scans up to `capacity` slots from the cursor and echoes the pending
    /// payload of the first eligible one. Returns `None`, leaving the cursor
    /// where it was, when no slot is eligible.
    pub fn pass(&mut self, table: &mut ConnectionTable) -> Option<LinkRequest> {
        let capacity = table.capacity();
        if capacity == 0 {
            return None;
        }
        let start = self.cursor % capacity;

        for offset in 0..capacity {
            let index = (start + offset) % capacity;
            let ready = table.slot_at(index).is_some_and(|slot| slot.is_ready_to_send());
            if !ready {
                continue;
            }
            let Some(slot) = table.handle_at(index).and_then(|h| table.get_mut(h)) else {
                continue;
            };
            let Some(channel) = slot.channel() else {
                continue;
            };
            match slot.take_for_send() {
                Ok(Some(data)) => {
                    self.cursor = (index + 1) % capacity;
                    self.sent += 1;
                    tracing::trace!(
                        %channel,
                        len = data.len(),
                        tx = slot.credits().tx_remaining(),
                        "relay: echoing payload"
                    );
                    return Some(LinkRequest::SendData { channel, data });
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(%channel, error = %e, "relay: send refused");
                }
            }
        }
        tracing::trace!(cursor = self.cursor, "relay: nothing eligible");
        None
    }
}
