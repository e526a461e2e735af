//! Fibre Channel frame dissection
//!
//! Parses the 24-byte FC frame header, keeps exchange bookkeeping, feeds
//! multi-frame sequences to the reassembler and routes complete SCSI-FCP
//! payloads to [`crate::fcp`].
//!
//! ```text
//! Byte/     0       |       1       |       2       |       3       |
//!    +---------------+---------------+---------------+---------------+
//!   0| R_CTL         | D_ID                                          |
//!   4| CS_CTL        | S_ID                                          |
//!   8| TYPE          | F_CTL                                         |
//!  12| SEQ_ID        | DF_CTL        | SEQ_CNT                       |
//!  16| OX_ID                         | RX_ID                         |
//!  20| Parameter                                                     |
//!    +---------------+---------------+---------------+---------------+
//! ```

use crate::analysis::AnalysisSession;
use crate::annotation::Annotation;
use crate::buffer::FrameBytes;
use crate::conversation::{Address, ConversationId, Endpoint, Transport};
use crate::error::{DissectError, DissectResult};
use crate::exchange::ExchangeId;
use crate::fcp::{self, FcpContext, FcpIu};
use crate::frame::FrameInfo;
use crate::reassembly::{SequenceFrame, SequenceOutcome};

pub const FC_HEADER_SIZE: usize = 24;

/// R_CTL routing bits (upper nibble)
pub mod routing {
    pub const DEVICE_DATA: u8 = 0x00;
    pub const EXTENDED_LINK_SERVICE: u8 = 0x20;
    pub const FC4_LINK_DATA: u8 = 0x30;
    pub const VIDEO_DATA: u8 = 0x40;
    pub const EXTENDED_HEADER: u8 = 0x50;
    pub const BASIC_LINK_SERVICE: u8 = 0x80;
    pub const LINK_CONTROL: u8 = 0xC0;
}

/// FC-4 TYPE values
pub mod fc_type {
    pub const BLS: u8 = 0x00;
    pub const ELS: u8 = 0x01;
    pub const LLC_SNAP: u8 = 0x05;
    pub const SCSI_FCP: u8 = 0x08;
    pub const FC_CT: u8 = 0x20;
    pub const SW_ILS: u8 = 0x22;
    pub const VENDOR_FIRST: u8 = 0xE0;
}

/// F_CTL bits (24-bit field)
pub mod f_ctl {
    pub const EXCHANGE_RESPONDER: u32 = 0x80_0000;
    pub const SEQ_RECIPIENT: u32 = 0x40_0000;
    pub const EXCHANGE_FIRST: u32 = 0x20_0000;
    pub const EXCHANGE_LAST: u32 = 0x10_0000;
    pub const SEQ_LAST: u32 = 0x08_0000;
    pub const PRIORITY: u32 = 0x02_0000;
    pub const TRANSFER_SEQ_INITIATIVE: u32 = 0x01_0000;
    pub const REL_OFFSET: u32 = 0x00_0008;
}

/// DF_CTL optional header bits
pub mod df_ctl {
    pub const ESP_HEADER: u8 = 0x40;
    pub const NETWORK_HEADER: u8 = 0x20;
    pub const ASSOCIATION_HEADER: u8 = 0x10;
    pub const DEVICE_HEADER_MASK: u8 = 0x03;
}

/// Sequence boundaries signalled by the SOF/EOF delimiters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Delimiters {
    pub first_of_sequence: bool,
    pub last_of_sequence: bool,
}

/// How the frame reached us
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FcEncapsulation {
    pub delimiters: Delimiters,
    /// Bytes after the FC payload (CRC, EOF) in this encapsulation
    pub trailer_len: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    BasicLinkService,
    LinkControl,
    ExtendedLinkService,
    Fcp,
    VendorSpecific,
    Other,
}

impl FrameKind {
    /// Frame kinds that are always complete single-frame units
    pub fn never_fragments(&self) -> bool {
        matches!(
            self,
            FrameKind::BasicLinkService | FrameKind::LinkControl | FrameKind::VendorSpecific
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FcHeader {
    pub r_ctl: u8,
    pub d_id: u32,
    pub cs_ctl: u8,
    pub s_id: u32,
    pub fc_type: u8,
    pub f_ctl: u32,
    pub seq_id: u8,
    pub df_ctl: u8,
    pub seq_cnt: u16,
    pub ox_id: u16,
    pub rx_id: u16,
    pub param: u32,
}

impl FcHeader {
    pub fn parse(fb: &FrameBytes<'_>) -> DissectResult<Self> {
        fb.ensure(0, FC_HEADER_SIZE)?;
        Ok(FcHeader {
            r_ctl: fb.u8(0)?,
            d_id: fb.u24(1)?,
            cs_ctl: fb.u8(4)?,
            s_id: fb.u24(5)?,
            fc_type: fb.u8(8)?,
            f_ctl: fb.u24(9)?,
            seq_id: fb.u8(12)?,
            df_ctl: fb.u8(13)?,
            seq_cnt: fb.u16(14)?,
            ox_id: fb.u16(16)?,
            rx_id: fb.u16(18)?,
            param: fb.u32(20)?,
        })
    }

    pub fn routing(&self) -> u8 {
        self.r_ctl & 0xF0
    }

    /// R_CTL information category
    pub fn category(&self) -> u8 {
        self.r_ctl & 0x0F
    }

    pub fn kind(&self) -> FrameKind {
        match self.routing() {
            routing::BASIC_LINK_SERVICE => FrameKind::BasicLinkService,
            routing::LINK_CONTROL => FrameKind::LinkControl,
            routing::EXTENDED_LINK_SERVICE => FrameKind::ExtendedLinkService,
            _ if self.fc_type >= fc_type::VENDOR_FIRST => FrameKind::VendorSpecific,
            routing::DEVICE_DATA if self.fc_type == fc_type::SCSI_FCP => FrameKind::Fcp,
            _ => FrameKind::Other,
        }
    }

    pub fn is_responder(&self) -> bool {
        self.f_ctl & f_ctl::EXCHANGE_RESPONDER != 0
    }

    pub fn first_of_exchange(&self) -> bool {
        self.f_ctl & f_ctl::EXCHANGE_FIRST != 0
    }

    pub fn last_of_exchange(&self) -> bool {
        self.f_ctl & f_ctl::EXCHANGE_LAST != 0
    }

    pub fn last_of_sequence(&self) -> bool {
        self.f_ctl & f_ctl::SEQ_LAST != 0
    }

    /// Relative offset carried in the parameter field, when flagged
    pub fn relative_offset(&self) -> u32 {
        if self.f_ctl & f_ctl::REL_OFFSET != 0 {
            self.param
        } else {
            0
        }
    }

    /// Bytes of optional headers between the frame header and the payload
    pub fn optional_header_len(&self) -> usize {
        let mut len = 0;
        if self.df_ctl & df_ctl::ESP_HEADER != 0 {
            len += 8;
        }
        if self.df_ctl & df_ctl::NETWORK_HEADER != 0 {
            len += 16;
        }
        if self.df_ctl & df_ctl::ASSOCIATION_HEADER != 0 {
            len += 32;
        }
        len + (self.df_ctl & df_ctl::DEVICE_HEADER_MASK) as usize * 16
    }

    /// SCSI target side of the exchange
    pub fn target(&self) -> Address {
        if self.is_responder() {
            Address::fc(self.s_id)
        } else {
            Address::fc(self.d_id)
        }
    }
}

/// Everything learned from one FC frame
#[derive(Debug, Clone)]
pub struct FcDissection {
    pub header: FcHeader,
    pub kind: FrameKind,
    pub conversation: ConversationId,
    pub exchange: Option<ExchangeId>,
    pub outcome: SequenceOutcome,
    /// Complete sequence payload, once available in this frame
    pub payload: Option<Vec<u8>>,
    pub fcp: Option<FcpIu>,
    pub annotations: Vec<Annotation>,
}

pub(crate) fn dissect_frame(
    session: &mut AnalysisSession,
    frame: &FrameInfo,
    data: &[u8],
    encap: FcEncapsulation,
) -> DissectResult<FcDissection> {
    let fb = FrameBytes::new(data);
    let header = FcHeader::parse(&fb)?;
    let payload_start = FC_HEADER_SIZE + header.optional_header_len();
    let needed = payload_start + encap.trailer_len;
    if data.len() < needed {
        return Err(DissectError::Bounds {
            offset: 0,
            needed,
            available: data.len(),
        });
    }
    let payload = fb.bytes(payload_start, data.len() - needed)?;
    let kind = header.kind();

    // Nothing above may fail once tables start changing
    let conversation = session.conversations.find_or_create(
        Endpoint::new(Address::fc(header.s_id), 0),
        Endpoint::new(Address::fc(header.d_id), 0),
        Transport::FibreChannel,
    );

    let exchange = if frame.first_visit {
        let id = session
            .exchanges
            .get_or_create(conversation, header.ox_id, frame.timestamp);
        session.exchanges.update_boundaries(
            id,
            frame.number,
            frame.timestamp,
            header.first_of_exchange(),
            header.last_of_exchange(),
        );
        Some(id)
    } else {
        session.exchanges.lookup(conversation, header.ox_id)
    };

    let mut annotations = Vec::new();
    if let Some(id) = exchange {
        annotations.extend(session.exchanges.get(id).annotations(
            frame.number,
            frame.timestamp,
            header.last_of_exchange(),
        ));
    }

    let prefs = &session.prefs;
    let outcome = if prefs.fc.reassemble && !kind.never_fragments() {
        let seq = SequenceFrame {
            ox_id: header.ox_id,
            seq_id: header.seq_id,
            responder: header.is_responder(),
            seq_cnt: header.seq_cnt,
            first_of_sequence: encap.delimiters.first_of_sequence,
            last_of_sequence: encap.delimiters.last_of_sequence || header.last_of_sequence(),
        };
        session
            .sequences
            .process(conversation, frame, &seq, payload, prefs.fc.max_frame_size)
    } else {
        SequenceOutcome::Complete
    };
    annotations.extend(outcome.annotations(frame.number, payload));

    let complete: Option<Vec<u8>> = match &outcome {
        SequenceOutcome::Complete => Some(payload.to_vec()),
        SequenceOutcome::Reassembled(r) => Some(r.data.clone()),
        SequenceOutcome::Fragment { .. } | SequenceOutcome::Bogus => None,
    };

    let mut fcp_iu = None;
    if let (FrameKind::Fcp, Some(bytes), Some(id)) = (kind, complete.as_deref(), exchange) {
        let ctx = FcpContext {
            task: &mut session.exchanges.get_mut(id).scsi,
            devices: &mut session.devices,
            prefs: &session.prefs.scsi,
            target: header.target(),
            responder: header.is_responder(),
            relative_offset: header.relative_offset(),
            first_visit: frame.first_visit,
        };
        match fcp::dissect(header.category(), bytes, ctx) {
            Ok(iu) => fcp_iu = Some(iu),
            Err(e) => {
                log::debug!("Frame {}: FCP payload not interpreted: {}", frame.number, e);
                annotations.push(Annotation::Undissected(bytes.to_vec()));
            }
        }
    }

    Ok(FcDissection {
        header,
        kind,
        conversation,
        exchange,
        outcome,
        payload: complete,
        fcp: fcp_iu,
        annotations,
    })
}

// ============================================================================
// Unit Tests
// ============================================================================
