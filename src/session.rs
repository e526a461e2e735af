//! iSCSI per-connection protocol state
//!
//! Whether a connection carries header digests is not known from the capture
//! alone unless the login was captured. The mode starts as
//! [`HeaderDigestMode::AutoPending`] and is decided once, on the first visit
//! of the first PDU with at least 52 bytes available: if the CRC32C of the
//! 48-byte header matches the following 4 bytes, the connection uses header
//! digests. The decision is never revisited, and each PDU keeps the mode it
//! was framed with on its first visit, so later passes cut segments the same
//! way even for PDUs seen before the decision.
//!
//! Login and Text responses are also mined for negotiated `key=value`
//! parameters (RFC 3720 Section 5), which are kept for display.

use crate::conversation::ConversationId;
use crate::digest::{verify_digest, DIGEST_SIZE};
use crate::frame::FrameInfo;
use std::collections::HashMap;

/// Header size the auto detection computes the digest over
const DETECT_HEADER_SIZE: usize = 48;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HeaderDigestMode {
    /// Not decided yet
    #[default]
    AutoPending,
    None,
    Crc32c,
}

impl HeaderDigestMode {
    /// Bytes of header digest following the header
    pub fn digest_len(&self) -> usize {
        match self {
            HeaderDigestMode::Crc32c => DIGEST_SIZE,
            _ => 0,
        }
    }
}

/// State of one iSCSI connection
#[derive(Debug, Clone, Default)]
pub struct IscsiSession {
    pub header_digest: HeaderDigestMode,
    /// Login reached full feature phase
    pub full_feature: bool,
    /// Operational parameters seen in Login/Text responses
    pub negotiated: HashMap<String, String>,
}

impl IscsiSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Negotiated value of a text key, if one was captured
    pub fn param(&self, key: &str) -> Option<&str> {
        self.negotiated.get(key).map(|v| v.as_str())
    }

    /// Apply the parameters of a Login or Text response data segment
    pub fn apply_text_response(&mut self, data: &[u8]) {
        for (key, value) in parse_text_parameters(data) {
            log::trace!("Negotiated {}={}", key, value);
            self.negotiated.insert(key, value);
        }
    }
}

/// Parse null-separated `key=value` text parameters
pub fn parse_text_parameters(data: &[u8]) -> Vec<(String, String)> {
    data.split(|&b| b == 0)
        .filter(|chunk| !chunk.is_empty())
        .filter_map(|chunk| {
            let s = String::from_utf8_lossy(chunk);
            s.find('=')
                .map(|eq| (s[..eq].to_string(), s[eq + 1..].to_string()))
        })
        .collect()
}

#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: HashMap<ConversationId, IscsiSession>,
    /// Mode used for the PDU at (frame number, segment offset) on first visit
    pdu_modes: HashMap<(u32, usize), HeaderDigestMode>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, conversation: ConversationId) -> Option<&IscsiSession> {
        self.sessions.get(&conversation)
    }

    pub fn get_or_create(&mut self, conversation: ConversationId) -> &mut IscsiSession {
        self.sessions.entry(conversation).or_default()
    }

    /// Current header digest mode, without deciding it
    pub fn header_digest_mode(&self, conversation: ConversationId) -> HeaderDigestMode {
        self.sessions
            .get(&conversation)
            .map(|s| s.header_digest)
            .unwrap_or_default()
    }

    /// Header digest mode for the PDU at `offset` in the frame's segment
    ///
    /// On the frame's first visit, a pending mode is settled by a PDU with at
    /// least 52 bytes available, and the mode used is stored for the PDU.
    /// Revisits return the stored mode, falling back to the current one for
    /// PDUs never seen on a first visit.
    pub fn resolve_header_digest(
        &mut self,
        conversation: ConversationId,
        frame: &FrameInfo,
        offset: usize,
        pdu: &[u8],
    ) -> HeaderDigestMode {
        let position = (frame.number, offset);
        if !frame.first_visit {
            return match self.pdu_modes.get(&position) {
                Some(&mode) => mode,
                None => self.header_digest_mode(conversation),
            };
        }

        let mode = self.detect_header_digest(conversation, pdu);
        self.pdu_modes.insert(position, mode);
        mode
    }

    fn detect_header_digest(
        &mut self,
        conversation: ConversationId,
        pdu: &[u8],
    ) -> HeaderDigestMode {
        let current = self.header_digest_mode(conversation);
        if current != HeaderDigestMode::AutoPending
            || pdu.len() < DETECT_HEADER_SIZE + DIGEST_SIZE
        {
            return current;
        }

        let received = u32::from_be_bytes([
            pdu[DETECT_HEADER_SIZE],
            pdu[DETECT_HEADER_SIZE + 1],
            pdu[DETECT_HEADER_SIZE + 2],
            pdu[DETECT_HEADER_SIZE + 3],
        ]);
        let mode = if verify_digest(&pdu[..DETECT_HEADER_SIZE], received).is_good() {
            HeaderDigestMode::Crc32c
        } else {
            HeaderDigestMode::None
        };
        log::debug!("Header digest on {} detected as {:?}", conversation, mode);
        self.get_or_create(conversation).header_digest = mode;
        mode
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
