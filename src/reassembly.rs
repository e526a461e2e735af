//! Fragment accumulation and FC sequence reassembly
//!
//! [`FragmentTable`] collects byte ranges per fragment key, in any arrival
//! order, until the last fragment is in and the ranges cover the whole
//! payload without gaps. [`SequenceReassembler`] sits on top of it and turns
//! FC frame bookkeeping (SEQ_ID, SEQ_CNT, first/last of sequence) into
//! fragment offsets.
//!
//! SEQ_CNT may either restart at 0 for each sequence or keep counting across
//! sequences of an exchange (streaming). The SEQ_CNT of the first frame of a
//! sequence is remembered per conversation and subtracted, so fragment
//! offsets are always zero based.

use crate::annotation::Annotation;
use crate::conversation::ConversationId;
use crate::frame::FrameInfo;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FragmentKey {
    pub conversation: ConversationId,
    pub id: u32,
}

#[derive(Debug, Clone)]
struct Fragment {
    frame: u32,
    offset: u32,
    data: Vec<u8>,
}

#[derive(Debug, Default)]
struct PendingPayload {
    fragments: Vec<Fragment>,
    total_len: Option<u32>,
}

impl PendingPayload {
    /// Contiguous payload if every byte up to `total_len` is present
    ///
    /// Coverage is checked on the fragment ranges first; the buffer is only
    /// allocated once the payload is known to be complete.
    fn assemble(&self) -> Option<Vec<u8>> {
        let total = self.total_len? as usize;
        let mut sorted: Vec<&Fragment> = self.fragments.iter().collect();
        sorted.sort_by_key(|f| (f.offset, f.frame));

        let mut covered = 0usize;
        for frag in &sorted {
            let start = frag.offset as usize;
            if start > covered {
                return None;
            }
            covered = covered.max(start.saturating_add(frag.data.len()));
            if covered >= total {
                break;
            }
        }
        if covered < total {
            return None;
        }

        let mut buf = vec![0u8; total];
        for frag in sorted {
            let start = frag.offset as usize;
            if start >= total {
                continue;
            }
            let end = (start + frag.data.len()).min(total);
            buf[start..end].copy_from_slice(&frag.data[..end - start]);
        }
        Some(buf)
    }
}

/// A payload rebuilt from several frames
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reassembled {
    pub data: Vec<u8>,
    /// Contributing frames in offset order
    pub frames: Vec<u32>,
    /// Frame whose arrival completed the payload
    pub completed_in: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FragmentResult {
    Pending,
    Complete(Arc<Reassembled>),
}

/// Generic defragmentation by key, offset and "more fragments" flag
#[derive(Debug, Default)]
pub struct FragmentTable {
    pending: HashMap<FragmentKey, PendingPayload>,
}

impl FragmentTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &mut self,
        key: FragmentKey,
        frame: u32,
        offset: u32,
        data: &[u8],
        more_follow: bool,
    ) -> FragmentResult {
        let pending = self.pending.entry(key).or_default();
        if pending
            .fragments
            .iter()
            .any(|f| f.frame == frame && f.offset == offset)
        {
            return FragmentResult::Pending;
        }

        pending.fragments.push(Fragment {
            frame,
            offset,
            data: data.to_vec(),
        });
        if !more_follow {
            let total = offset.saturating_add(data.len() as u32);
            if let Some(previous) = pending.total_len.filter(|&t| t != total) {
                log::warn!(
                    "Fragment 0x{:08x} on {}: last fragment in frame {} changes length {} -> {}",
                    key.id,
                    key.conversation,
                    frame,
                    previous,
                    total
                );
            }
            pending.total_len = Some(total);
        }

        let data = match pending.assemble() {
            Some(data) => data,
            None => return FragmentResult::Pending,
        };
        let mut fragments = match self.pending.remove(&key) {
            Some(p) => p.fragments,
            None => return FragmentResult::Pending,
        };
        fragments.sort_by_key(|f| (f.offset, f.frame));
        let mut frames: Vec<u32> = fragments.iter().map(|f| f.frame).collect();
        frames.dedup();

        log::debug!(
            "Fragment 0x{:08x} on {} reassembled in frame {} from {} frames ({} bytes)",
            key.id,
            key.conversation,
            frame,
            frames.len(),
            data.len()
        );
        FragmentResult::Complete(Arc::new(Reassembled {
            data,
            frames,
            completed_in: frame,
        }))
    }

    /// Number of payloads still waiting for fragments
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Per-conversation SEQ_CNT base of the current sequence
#[derive(Debug, Default)]
pub struct SequenceTracker {
    bases: HashMap<ConversationId, u16>,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Zero-based position of a frame within its sequence
    pub fn normalize(
        &mut self,
        conversation: ConversationId,
        seq_cnt: u16,
        first_of_sequence: bool,
    ) -> u16 {
        if first_of_sequence {
            self.bases.insert(conversation, seq_cnt);
            return 0;
        }
        match self.bases.get(&conversation) {
            Some(&base) => seq_cnt.wrapping_sub(base),
            None => seq_cnt,
        }
    }

    pub fn base(&self, conversation: ConversationId) -> Option<u16> {
        self.bases.get(&conversation).copied()
    }
}

/// Sequence bookkeeping of one FC frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceFrame {
    pub ox_id: u16,
    pub seq_id: u8,
    /// Frame sent by the exchange responder
    pub responder: bool,
    pub seq_cnt: u16,
    pub first_of_sequence: bool,
    pub last_of_sequence: bool,
}

impl SequenceFrame {
    /// Key under which the fragments of this sequence accumulate
    pub fn fragment_id(&self) -> u32 {
        (((self.ox_id as u32) << 16) ^ self.seq_id as u32) | self.responder as u32
    }
}

/// What reassembly made of one frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SequenceOutcome {
    /// Single-frame sequence, the frame payload is complete as is
    Complete,
    /// Part of a sequence; `reassembled_in` is known once it completes
    Fragment { reassembled_in: Option<u32> },
    /// This frame completed the sequence
    Reassembled(Arc<Reassembled>),
    /// Last but not first of a sequence at position 0, or a position whose
    /// byte offset does not fit in 32 bits
    Bogus,
}

impl SequenceOutcome {
    pub fn annotations(&self, frame: u32, payload: &[u8]) -> Vec<Annotation> {
        match self {
            SequenceOutcome::Complete => Vec::new(),
            SequenceOutcome::Fragment {
                reassembled_in: Some(n),
            } => vec![Annotation::ReassembledIn(*n)],
            SequenceOutcome::Fragment { reassembled_in: None } => {
                vec![Annotation::Undissected(payload.to_vec())]
            }
            SequenceOutcome::Reassembled(r) if r.frames.len() > 1 || r.completed_in != frame => {
                vec![Annotation::ReassembledFrom(r.frames.clone())]
            }
            SequenceOutcome::Reassembled(_) => Vec::new(),
            SequenceOutcome::Bogus => vec![
                Annotation::BogusFragment,
                Annotation::Undissected(payload.to_vec()),
            ],
        }
    }
}

/// FC sequence reassembly engine
#[derive(Debug, Default)]
pub struct SequenceReassembler {
    tracker: SequenceTracker,
    fragments: FragmentTable,
    outcomes: HashMap<u32, SequenceOutcome>,
}

impl SequenceReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one frame that may be part of a multi-frame sequence
    ///
    /// State changes only on the frame's first visit; revisits return the
    /// outcome recorded then.
    pub fn process(
        &mut self,
        conversation: ConversationId,
        frame: &FrameInfo,
        seq: &SequenceFrame,
        payload: &[u8],
        max_frame_size: u32,
    ) -> SequenceOutcome {
        if !frame.first_visit {
            return self
                .outcomes
                .get(&frame.number)
                .cloned()
                .unwrap_or(SequenceOutcome::Complete);
        }

        let real_seq_cnt = self
            .tracker
            .normalize(conversation, seq.seq_cnt, seq.first_of_sequence);

        if seq.first_of_sequence && seq.last_of_sequence {
            return SequenceOutcome::Complete;
        }

        let outcome = if seq.last_of_sequence && !seq.first_of_sequence && real_seq_cnt == 0 {
            log::debug!(
                "Frame {}: last of sequence 0x{:02x} (OX_ID 0x{:04x}) at position 0, bogus",
                frame.number,
                seq.seq_id,
                seq.ox_id
            );
            SequenceOutcome::Bogus
        } else if let Some(offset) = (real_seq_cnt as u32).checked_mul(max_frame_size) {
            let key = FragmentKey {
                conversation,
                id: seq.fragment_id(),
            };
            match self
                .fragments
                .add(key, frame.number, offset, payload, !seq.last_of_sequence)
            {
                FragmentResult::Pending => SequenceOutcome::Fragment { reassembled_in: None },
                FragmentResult::Complete(r) => {
                    for &n in r.frames.iter().filter(|&&n| n != frame.number) {
                        self.outcomes.insert(
                            n,
                            SequenceOutcome::Fragment {
                                reassembled_in: Some(frame.number),
                            },
                        );
                    }
                    SequenceOutcome::Reassembled(r)
                }
            }
        } else {
            log::debug!(
                "Frame {}: SEQ_CNT position {} with frame size {} overflows the fragment offset",
                frame.number,
                real_seq_cnt,
                max_frame_size
            );
            SequenceOutcome::Bogus
        };
        self.outcomes.insert(frame.number, outcome.clone());
        outcome
    }

    pub fn tracker(&self) -> &SequenceTracker {
        &self.tracker
    }

    pub fn fragments(&self) -> &FragmentTable {
        &self.fragments
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
