//! Fibre Channel exchange registry
//!
//! One [`Exchange`] exists per (conversation, OX_ID). Records are created the
//! first time an OX_ID is seen on a conversation and are kept for the rest of
//! the session. A later exchange that reuses the same 16-bit OX_ID shares the
//! record and overwrites its first/last frame bookkeeping, including after
//! OX_ID wraparound in very long captures.

use crate::annotation::Annotation;
use crate::conversation::ConversationId;
use crate::scsi::ScsiTaskInfo;
use std::collections::HashMap;
use std::time::Duration;

/// Index of an exchange record in the registry arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExchangeId(usize);

#[derive(Debug, Clone)]
pub struct Exchange {
    pub conversation: ConversationId,
    pub ox_id: u16,
    /// Frame carrying the first-of-exchange flag, 0 if none seen
    pub first_frame: u32,
    /// Frame carrying the last-of-exchange flag, 0 if none seen
    pub last_frame: u32,
    /// Timestamp of the first frame of the exchange
    pub base_time: Duration,
    pub scsi: ScsiTaskInfo,
}

impl Exchange {
    /// Cross references for a frame of this exchange
    pub fn annotations(&self, frame: u32, now: Duration, is_last: bool) -> Vec<Annotation> {
        let mut out = Vec::new();
        if self.first_frame != 0 && self.first_frame != frame {
            out.push(Annotation::ExchangeFirstFrame(self.first_frame));
        }
        if self.last_frame != 0 && self.last_frame != frame {
            out.push(Annotation::ExchangeLastFrame(self.last_frame));
        }
        if is_last && self.first_frame != 0 {
            out.push(Annotation::ExchangeTime(now.saturating_sub(self.base_time)));
        }
        out
    }
}

#[derive(Debug, Default)]
pub struct ExchangeTable {
    index: HashMap<(ConversationId, u16), ExchangeId>,
    arena: Vec<Exchange>,
}

impl ExchangeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(
        &mut self,
        conversation: ConversationId,
        ox_id: u16,
        now: Duration,
    ) -> ExchangeId {
        if let Some(&id) = self.index.get(&(conversation, ox_id)) {
            return id;
        }
        let id = ExchangeId(self.arena.len());
        self.arena.push(Exchange {
            conversation,
            ox_id,
            first_frame: 0,
            last_frame: 0,
            base_time: now,
            scsi: ScsiTaskInfo::default(),
        });
        self.index.insert((conversation, ox_id), id);
        log::trace!("New exchange 0x{:04x} on {}", ox_id, conversation);
        id
    }

    pub fn lookup(&self, conversation: ConversationId, ox_id: u16) -> Option<ExchangeId> {
        self.index.get(&(conversation, ox_id)).copied()
    }

    /// Record exchange boundaries; only call on a frame's first visit
    pub fn update_boundaries(
        &mut self,
        id: ExchangeId,
        frame: u32,
        now: Duration,
        first_of_exchange: bool,
        last_of_exchange: bool,
    ) {
        let ex = &mut self.arena[id.0];
        if first_of_exchange {
            if ex.last_frame != 0 {
                log::debug!(
                    "OX_ID 0x{:04x} on {} reused in frame {}, rebinding exchange",
                    ex.ox_id,
                    ex.conversation,
                    frame
                );
            }
            ex.first_frame = frame;
            ex.base_time = now;
        }
        if last_of_exchange {
            ex.last_frame = frame;
        }
    }

    pub fn get(&self, id: ExchangeId) -> &Exchange {
        &self.arena[id.0]
    }

    pub fn get_mut(&mut self, id: ExchangeId) -> &mut Exchange {
        &mut self.arena[id.0]
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }
}
