//! iSCSI PDU dissection
//!
//! Walks the PDUs contained in one TCP segment, checks header and data
//! digests, and correlates SCSI Command, Data-In, Data-Out and Response PDUs
//! into tasks. Based on RFC 3720: https://datatracker.ietf.org/doc/html/rfc3720
//!
//! ```text
//! Byte/     0       |       1       |       2       |       3       |
//!    +---------------+---------------+---------------+---------------+
//!   0|.|I| Opcode    |F|  Opcode-specific fields                     |
//!   4|TotalAHSLength | DataSegmentLength                             |
//!   8| LUN or Opcode-specific fields (8 bytes)                       |
//!  16| Initiator Task Tag                                            |
//!  20| Opcode-specific fields (28 bytes)                             |
//!    +---------------+---------------+---------------+---------------+
//!  48| AHS (optional) | Header digest | Data segment | Data digest  |
//! ```

use crate::analysis::AnalysisSession;
use crate::annotation::Annotation;
use crate::buffer::FrameBytes;
use crate::config::IscsiPreferences;
use crate::conversation::{ConversationId, Transport};
use crate::digest::{verify_digest, DigestCheck, DIGEST_SIZE};
use crate::error::{DissectError, DissectResult};
use crate::fcp::lun_from_bytes;
use crate::frame::FrameInfo;
use crate::scsi::{self, ScsiCommand, ScsiResponse, ScsiTaskInfo};
use crate::session::HeaderDigestMode;
use crate::task::{TaskId, TaskRole};
use byteorder::{BigEndian, ByteOrder};

/// Basic Header Segment size
pub const BHS_SIZE: usize = 48;

/// Largest TotalAHSLength (in 4-byte words) the bogosity filter accepts
const MAX_AHS_WORDS: u8 = 16;

/// iSCSI opcodes (RFC 3720 Section 10.2.1.2)
pub mod opcode {
    // Initiator opcodes
    pub const NOP_OUT: u8 = 0x00;
    pub const SCSI_COMMAND: u8 = 0x01;
    pub const TASK_MANAGEMENT_REQUEST: u8 = 0x02;
    pub const LOGIN_REQUEST: u8 = 0x03;
    pub const TEXT_REQUEST: u8 = 0x04;
    pub const SCSI_DATA_OUT: u8 = 0x05;
    pub const LOGOUT_REQUEST: u8 = 0x06;
    pub const SNACK_REQUEST: u8 = 0x10;

    // Target opcodes
    pub const NOP_IN: u8 = 0x20;
    pub const SCSI_RESPONSE: u8 = 0x21;
    pub const TASK_MANAGEMENT_RESPONSE: u8 = 0x22;
    pub const LOGIN_RESPONSE: u8 = 0x23;
    pub const TEXT_RESPONSE: u8 = 0x24;
    pub const SCSI_DATA_IN: u8 = 0x25;
    pub const LOGOUT_RESPONSE: u8 = 0x26;
    pub const R2T: u8 = 0x31;
    pub const ASYNC_MESSAGE: u8 = 0x32;
    pub const REJECT: u8 = 0x3F;

    /// Set on every PDU sent by the target
    pub const TARGET_BIT: u8 = 0x20;
}

/// BHS flag bits (byte 1)
pub mod flags {
    pub const FINAL: u8 = 0x80;

    // SCSI Command
    pub const READ: u8 = 0x40;
    pub const WRITE: u8 = 0x20;
    pub const ATTR_MASK: u8 = 0x07;

    // SCSI Data-In
    pub const ACKNOWLEDGE: u8 = 0x40;
    pub const OVERFLOW: u8 = 0x04;
    pub const UNDERFLOW: u8 = 0x02;
    pub const STATUS: u8 = 0x01;

    // Login
    pub const TRANSIT: u8 = 0x80;
    pub const CONTINUE: u8 = 0x40;
    pub const NSG_MASK: u8 = 0x03;
    pub const NSG_FULL_FEATURE: u8 = 0x03;
}

/// Additional Header Segment types
pub mod ahs_type {
    pub const EXTENDED_CDB: u8 = 0x01;
    pub const BIDIR_READ_LENGTH: u8 = 0x02;
}

pub fn opcode_name(op: u8) -> &'static str {
    match op {
        opcode::NOP_OUT => "NOP-Out",
        opcode::SCSI_COMMAND => "SCSI Command",
        opcode::TASK_MANAGEMENT_REQUEST => "Task Management Request",
        opcode::LOGIN_REQUEST => "Login Request",
        opcode::TEXT_REQUEST => "Text Request",
        opcode::SCSI_DATA_OUT => "SCSI Data-Out",
        opcode::LOGOUT_REQUEST => "Logout Request",
        opcode::SNACK_REQUEST => "SNACK Request",
        opcode::NOP_IN => "NOP-In",
        opcode::SCSI_RESPONSE => "SCSI Response",
        opcode::TASK_MANAGEMENT_RESPONSE => "Task Management Response",
        opcode::LOGIN_RESPONSE => "Login Response",
        opcode::TEXT_RESPONSE => "Text Response",
        opcode::SCSI_DATA_IN => "SCSI Data-In",
        opcode::LOGOUT_RESPONSE => "Logout Response",
        opcode::R2T => "Ready To Transfer",
        opcode::ASYNC_MESSAGE => "Async Message",
        opcode::REJECT => "Reject",
        _ => "Unknown",
    }
}

fn is_known_opcode(op: u8) -> bool {
    opcode_name(op) != "Unknown"
}

/// PDU types on which the F bit is always set
fn always_final(op: u8) -> bool {
    matches!(
        op,
        opcode::NOP_OUT
            | opcode::NOP_IN
            | opcode::TASK_MANAGEMENT_REQUEST
            | opcode::TASK_MANAGEMENT_RESPONSE
            | opcode::SCSI_RESPONSE
            | opcode::LOGOUT_REQUEST
            | opcode::LOGOUT_RESPONSE
            | opcode::SNACK_REQUEST
            | opcode::R2T
            | opcode::ASYNC_MESSAGE
            | opcode::REJECT
    )
}

/// Basic Header Segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bhs {
    /// Opcode (lower 6 bits of byte 0)
    pub opcode: u8,
    /// Immediate delivery (bit 6 of byte 0)
    pub immediate: bool,
    pub flags: u8,
    /// TotalAHSLength in 4-byte words
    pub ahs_length: u8,
    /// DataSegmentLength in bytes, without padding
    pub data_length: u32,
    pub lun: [u8; 8],
    pub itt: u32,
    raw: [u8; BHS_SIZE],
}

impl Bhs {
    pub fn new(opcode: u8, flags: u8, itt: u32) -> Self {
        Bhs {
            opcode,
            immediate: false,
            flags,
            ahs_length: 0,
            data_length: 0,
            lun: [0u8; 8],
            itt,
            raw: [0u8; BHS_SIZE],
        }
    }

    /// Parse the first 48 bytes of `buf`
    pub fn parse(buf: &[u8]) -> DissectResult<Self> {
        let fb = FrameBytes::new(buf);
        let header = fb.bytes(0, BHS_SIZE)?;
        let mut raw = [0u8; BHS_SIZE];
        raw.copy_from_slice(header);
        let mut lun = [0u8; 8];
        lun.copy_from_slice(&raw[8..16]);

        Ok(Bhs {
            opcode: raw[0] & 0x3F,
            immediate: raw[0] & 0x40 != 0,
            flags: raw[1],
            ahs_length: raw[4],
            data_length: fb.u24(5)?,
            lun,
            itt: fb.u32(16)?,
            raw,
        })
    }

    pub fn to_bytes(&self) -> [u8; BHS_SIZE] {
        let mut buf = self.raw;
        buf[0] = (if self.immediate { 0x40 } else { 0 }) | (self.opcode & 0x3F);
        buf[1] = self.flags;
        buf[4] = self.ahs_length;
        let len = self.data_length.to_be_bytes();
        buf[5..8].copy_from_slice(&len[1..]);
        buf[8..16].copy_from_slice(&self.lun);
        BigEndian::write_u32(&mut buf[16..20], self.itt);
        buf
    }

    /// Opcode-specific byte at BHS offset `offset`
    pub fn byte(&self, offset: usize) -> u8 {
        self.raw[offset]
    }

    pub fn set_byte(&mut self, offset: usize, value: u8) {
        self.raw[offset] = value;
    }

    /// Opcode-specific big-endian word at BHS offset `offset` (20..=44)
    pub fn field_u32(&self, offset: usize) -> u32 {
        BigEndian::read_u32(&self.raw[offset..offset + 4])
    }

    pub fn set_field_u32(&mut self, offset: usize, value: u32) {
        BigEndian::write_u32(&mut self.raw[offset..offset + 4], value);
    }

    /// CDB of a SCSI Command PDU
    pub fn cdb(&self) -> &[u8] {
        &self.raw[32..48]
    }

    pub fn is_final(&self) -> bool {
        self.flags & flags::FINAL != 0
    }

    pub fn from_target(&self) -> bool {
        self.opcode & opcode::TARGET_BIT != 0
    }

    pub fn opcode_name(&self) -> &'static str {
        opcode_name(self.opcode)
    }
}

/// One Additional Header Segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ahs {
    pub ahs_type: u8,
    /// AHS-specific bytes, starting with the byte after the type
    pub specific: Vec<u8>,
}

/// Split the AHS area of a PDU; an AHS running past the area is invalid
pub fn parse_ahs(bytes: &[u8]) -> DissectResult<Vec<Ahs>> {
    let fb = FrameBytes::new(bytes);
    let mut out = Vec::new();
    let mut offset = 0;
    while fb.has(offset, 4) {
        let len = fb.u16(offset)? as usize;
        let ahs_type = fb.u8(offset + 2)?;
        if !fb.has(offset + 3, len) {
            return Err(DissectError::InvalidPdu(format!(
                "AHS type 0x{:02x} at offset {} needs {} bytes, header has {}",
                ahs_type,
                offset,
                3 + len,
                bytes.len() - offset
            )));
        }
        let specific = fb.bytes(offset + 3, len)?;
        out.push(Ahs {
            ahs_type,
            specific: specific.to_vec(),
        });
        offset += (3 + len).div_ceil(4) * 4;
    }
    Ok(out)
}

/// Byte layout of one PDU on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PduLayout {
    /// End of BHS plus AHS
    pub header_end: usize,
    pub header_digest_len: usize,
    pub data_start: usize,
    pub data_len: usize,
    pub padded_len: usize,
    pub data_digest_len: usize,
    pub total: usize,
}

impl PduLayout {
    pub fn new(bhs: &Bhs, header_digest: HeaderDigestMode, prefs: &IscsiPreferences) -> Self {
        let header_end = BHS_SIZE + bhs.ahs_length as usize * 4;
        let header_digest_len = header_digest.digest_len();
        let data_start = header_end + header_digest_len;
        let data_len = bhs.data_length as usize;
        let padded_len = data_len.div_ceil(4) * 4;
        let data_digest_len = if prefs.enable_data_digest && data_len > 0 {
            if prefs.data_digest_is_crc32c {
                DIGEST_SIZE
            } else {
                prefs.data_digest_size as usize
            }
        } else {
            0
        };
        PduLayout {
            header_end,
            header_digest_len,
            data_start,
            data_len,
            padded_len,
            data_digest_len,
            total: data_start + padded_len + data_digest_len,
        }
    }
}

/// Heuristic check that `bhs` starts an iSCSI PDU on this flow
pub fn looks_like_iscsi(bhs: &Bhs, frame: &FrameInfo, prefs: &IscsiPreferences) -> bool {
    if !is_known_opcode(bhs.opcode) {
        return false;
    }
    if prefs.heuristic_ports
        && frame.src.port != prefs.target_port
        && frame.dst.port != prefs.target_port
    {
        return false;
    }
    if prefs.bogosity_filter
        && (bhs.data_length > prefs.bogus_data_length_threshold || bhs.ahs_length > MAX_AHS_WORDS)
    {
        return false;
    }
    if prefs.demand_good_f_bit && always_final(bhs.opcode) && !bhs.is_final() {
        return false;
    }
    true
}

/// SCSI-level meaning of a PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IscsiScsi {
    Command(ScsiCommand),
    DataIn {
        offset: u32,
        device_type: Option<u8>,
        /// Status carried by a Data-In with the S bit
        status: Option<ScsiResponse>,
    },
    DataOut {
        offset: u32,
    },
    Response {
        response_code: u8,
        scsi: ScsiResponse,
    },
}

#[derive(Debug, Clone)]
pub struct IscsiPdu {
    pub bhs: Bhs,
    pub layout: PduLayout,
    pub ahs: Vec<Ahs>,
    pub header_digest: Option<DigestCheck>,
    pub data_digest: Option<DigestCheck>,
    pub data: Vec<u8>,
    pub task: Option<TaskId>,
    pub scsi: Option<IscsiScsi>,
    pub annotations: Vec<Annotation>,
}

/// PDUs found in one TCP segment
#[derive(Debug, Clone, Default)]
pub struct IscsiSegment {
    pub conversation: Option<ConversationId>,
    pub pdus: Vec<IscsiPdu>,
    /// Further bytes the host must supply before the last PDU can be parsed
    pub needs_more: Option<usize>,
    pub annotations: Vec<Annotation>,
}

#[derive(Debug, Clone)]
pub enum IscsiDissection {
    /// The heuristics rejected the segment
    NotIscsi,
    Segment(IscsiSegment),
}

fn on_target_port(frame: &FrameInfo, prefs: &IscsiPreferences) -> bool {
    frame.src.port == prefs.target_port || frame.dst.port == prefs.target_port
}

pub(crate) fn dissect_segment(
    session: &mut AnalysisSession,
    frame: &FrameInfo,
    data: &[u8],
) -> DissectResult<IscsiDissection> {
    let prefs = session.prefs.iscsi.clone();

    if data.len() < BHS_SIZE {
        if prefs.reassemble
            && !data.is_empty()
            && prefs.heuristic_ports
            && on_target_port(frame, &prefs)
        {
            return Ok(IscsiDissection::Segment(IscsiSegment {
                needs_more: Some(BHS_SIZE - data.len()),
                ..IscsiSegment::default()
            }));
        }
        return Ok(IscsiDissection::NotIscsi);
    }
    if !looks_like_iscsi(&Bhs::parse(data)?, frame, &prefs) {
        return Ok(IscsiDissection::NotIscsi);
    }

    let conversation = session
        .conversations
        .find_or_create(frame.src, frame.dst, Transport::Tcp);
    let mut segment = IscsiSegment {
        conversation: Some(conversation),
        ..IscsiSegment::default()
    };

    let mut offset = 0;
    while offset < data.len() {
        let rest = &data[offset..];
        let missing = if rest.len() < BHS_SIZE {
            Some(BHS_SIZE - rest.len())
        } else {
            let bhs = Bhs::parse(rest)?;
            if offset > 0 && !looks_like_iscsi(&bhs, frame, &prefs) {
                log::debug!(
                    "Frame {}: bytes at offset {} do not start an iSCSI PDU",
                    frame.number,
                    offset
                );
                segment.annotations.push(Annotation::Undissected(rest.to_vec()));
                break;
            }
            let mode = session
                .sessions
                .resolve_header_digest(conversation, frame, offset, rest);
            let layout = PduLayout::new(&bhs, mode, &prefs);
            if rest.len() >= layout.total {
                let pdu = &rest[..layout.total];
                segment
                    .pdus
                    .push(dissect_pdu(session, frame, conversation, bhs, pdu, layout));
                offset += layout.total;
                None
            } else {
                Some(layout.total - rest.len())
            }
        };

        if let Some(missing) = missing {
            if prefs.reassemble {
                segment.needs_more = Some(missing);
            } else {
                segment.annotations.push(Annotation::Undissected(rest.to_vec()));
            }
            break;
        }
    }

    Ok(IscsiDissection::Segment(segment))
}

fn read_digest(pdu: &[u8], covered: std::ops::Range<usize>) -> DigestCheck {
    let at = covered.end;
    let received = BigEndian::read_u32(&pdu[at..at + DIGEST_SIZE]);
    verify_digest(&pdu[covered], received)
}

fn dissect_pdu(
    session: &mut AnalysisSession,
    frame: &FrameInfo,
    conversation: ConversationId,
    bhs: Bhs,
    pdu: &[u8],
    layout: PduLayout,
) -> IscsiPdu {
    let mut annotations = Vec::new();

    let header_digest = (layout.header_digest_len == DIGEST_SIZE)
        .then(|| read_digest(pdu, 0..layout.header_end));
    if let Some(check) = header_digest {
        annotations.push(Annotation::HeaderDigest(check));
    }

    let crc_data_digest = session.prefs.iscsi.data_digest_is_crc32c;
    let data_digest = (layout.data_digest_len == DIGEST_SIZE && crc_data_digest)
        .then(|| read_digest(pdu, layout.data_start..layout.data_start + layout.padded_len));
    if let Some(check) = data_digest {
        annotations.push(Annotation::DataDigest(check));
    }

    let ahs = match parse_ahs(&pdu[BHS_SIZE..layout.header_end]) {
        Ok(ahs) => ahs,
        Err(e) => {
            log::debug!("Frame {}: malformed AHS: {}", frame.number, e);
            annotations.push(Annotation::Undissected(pdu[BHS_SIZE..layout.header_end].to_vec()));
            Vec::new()
        }
    };
    let data = &pdu[layout.data_start..layout.data_start + layout.data_len];

    let (task, scsi) = correlate(session, frame, conversation, &bhs, &ahs, data, &mut annotations);
    if let Some(id) = task {
        annotations.extend(session.tasks.get(id).annotations(frame.number, frame.timestamp));
    }

    IscsiPdu {
        bhs,
        layout,
        ahs,
        header_digest,
        data_digest,
        data: data.to_vec(),
        task,
        scsi,
        annotations,
    }
}

fn correlate(
    session: &mut AnalysisSession,
    frame: &FrameInfo,
    conversation: ConversationId,
    bhs: &Bhs,
    ahs: &[Ahs],
    data: &[u8],
    annotations: &mut Vec<Annotation>,
) -> (Option<TaskId>, Option<IscsiScsi>) {
    let target = if bhs.from_target() { frame.src.addr } else { frame.dst.addr };

    match bhs.opcode {
        opcode::SCSI_COMMAND => {
            let id = session.tasks.on_command(conversation, bhs.itt, frame);

            let mut cdb = bhs.cdb().to_vec();
            let mut bidir_read_length = 0;
            for a in ahs {
                match a.ahs_type {
                    ahs_type::EXTENDED_CDB => {
                        cdb.extend_from_slice(a.specific.get(1..).unwrap_or(&[]))
                    }
                    ahs_type::BIDIR_READ_LENGTH => {
                        if let Some(b) = a.specific.get(1..5) {
                            bidir_read_length = BigEndian::read_u32(b);
                        }
                    }
                    _ => {}
                }
            }

            let scsi_prefs = &session.prefs.scsi;
            let class = session.devices.resolve(
                &target,
                scsi_prefs.device_type_override,
                scsi_prefs.default_device_type,
            );
            let mut scratch = ScsiTaskInfo::default();
            let (info, record) = match id {
                Some(id) => (&mut session.tasks.get_mut(id).scsi, frame.first_visit),
                None => (&mut scratch, false),
            };
            if record {
                info.lun = lun_from_bytes(&bhs.lun);
                info.read = bhs.flags & flags::READ != 0;
                info.write = bhs.flags & flags::WRITE != 0;
                info.expected_data_length = bhs.field_u32(20);
                info.bidir_read_length = bidir_read_length;
            }
            let scsi = match scsi::dissect_command(info, &cdb, class, record) {
                Ok(cmd) => Some(IscsiScsi::Command(cmd)),
                Err(e) => {
                    log::debug!("Frame {}: CDB not interpreted: {}", frame.number, e);
                    None
                }
            };
            (id, scsi)
        }

        opcode::SCSI_DATA_IN => {
            let collapsed = session.prefs.iscsi.protocol_version.has_data_in_status()
                && bhs.flags & flags::STATUS != 0;
            let id = session
                .tasks
                .on_followup(conversation, bhs.itt, TaskRole::DataIn, collapsed, frame);
            let offset = bhs.field_u32(40);
            let tasks = &session.tasks;
            let info = id.map(|id| &tasks.get(id).scsi);

            let device_type = info.and_then(|t| scsi::dissect_data_in(t, offset, data));
            let status = if collapsed {
                scsi::dissect_response(info, bhs.byte(3), &[]).ok()
            } else {
                None
            };
            let learn = frame.first_visit && session.prefs.scsi.device_type_override.is_none();
            if let (Some(devtype), true) = (device_type, learn) {
                session.devices.record(target, devtype);
            }
            (
                id,
                Some(IscsiScsi::DataIn {
                    offset,
                    device_type,
                    status,
                }),
            )
        }

        opcode::SCSI_DATA_OUT => {
            let id = session
                .tasks
                .on_followup(conversation, bhs.itt, TaskRole::DataOut, false, frame);
            (id, Some(IscsiScsi::DataOut { offset: bhs.field_u32(40) }))
        }

        opcode::SCSI_RESPONSE => {
            let id = session
                .tasks
                .on_followup(conversation, bhs.itt, TaskRole::Response, false, frame);
            let sense = if data.len() >= 2 {
                let len = BigEndian::read_u16(&data[..2]) as usize;
                &data[2..(2 + len).min(data.len())]
            } else {
                &[][..]
            };
            let tasks = &session.tasks;
            let info = id.map(|id| &tasks.get(id).scsi);
            let scsi = match scsi::dissect_response(info, bhs.byte(3), sense) {
                Ok(r) => Some(IscsiScsi::Response {
                    response_code: bhs.byte(2),
                    scsi: r,
                }),
                Err(e) => {
                    log::debug!("Frame {}: sense data not interpreted: {}", frame.number, e);
                    annotations.push(Annotation::Undissected(sense.to_vec()));
                    None
                }
            };
            (id, scsi)
        }

        opcode::LOGIN_RESPONSE | opcode::TEXT_RESPONSE => {
            if frame.first_visit {
                let state = session.sessions.get_or_create(conversation);
                state.apply_text_response(data);
                let status_class = bhs.byte(36);
                if bhs.opcode == opcode::LOGIN_RESPONSE
                    && bhs.flags & flags::TRANSIT != 0
                    && bhs.flags & flags::NSG_MASK == flags::NSG_FULL_FEATURE
                    && status_class == 0
                {
                    log::debug!(
                        "{} entered full feature phase in frame {}",
                        conversation,
                        frame.number
                    );
                    state.full_feature = true;
                }
            }
            (None, None)
        }

        _ => (None, None),
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::Endpoint;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn frame(src_port: u16, dst_port: u16) -> FrameInfo {
        FrameInfo::new(
            1,
            Duration::ZERO,
            Endpoint::new(Ipv4Addr::new(10, 0, 0, 1), src_port),
            Endpoint::new(Ipv4Addr::new(10, 0, 0, 2), dst_port),
        )
    }

    #[test]
    fn test_bhs_round_trip_fields() {
        let mut bhs = Bhs::new(opcode::SCSI_COMMAND, flags::FINAL | flags::READ, 0xDEADBEEF);
        bhs.immediate = true;
        bhs.data_length = 0x012345;
        bhs.lun[1] = 2;
        bhs.set_field_u32(20, 4096);
        bhs.set_byte(32, 0x28);

        let bytes = bhs.to_bytes();
        assert_eq!(bytes[0], 0x41);
        assert_eq!(&bytes[5..8], &[0x01, 0x23, 0x45]);
        assert_eq!(&bytes[16..20], &[0xDE, 0xAD, 0xBE, 0xEF]);

        let parsed = Bhs::parse(&bytes).unwrap();
        assert_eq!(parsed.to_bytes(), bytes);
        assert_eq!(parsed.itt, 0xDEADBEEF);
        assert_eq!(parsed.data_length, 0x012345);
        assert_eq!(parsed.lun, bhs.lun);
        assert_eq!(parsed.field_u32(20), 4096);
        assert_eq!(parsed.cdb()[0], 0x28);
        assert!(parsed.is_final());
        assert!(!parsed.from_target());
    }

    #[test]
    fn test_bhs_too_short() {
        assert!(Bhs::parse(&[0u8; 47]).is_err());
    }

    #[test]
    fn test_opcode_names() {
        assert_eq!(opcode_name(opcode::SCSI_DATA_IN), "SCSI Data-In");
        assert_eq!(opcode_name(opcode::R2T), "Ready To Transfer");
        assert_eq!(opcode_name(0x1A), "Unknown");
        assert!(Bhs::new(opcode::SCSI_RESPONSE, 0x80, 0).from_target());
    }

    #[test]
    fn test_heuristics() {
        let prefs = IscsiPreferences::default();
        let good = Bhs::new(opcode::SCSI_COMMAND, flags::FINAL, 1);
        assert!(looks_like_iscsi(&good, &frame(51000, 3260), &prefs));
        assert!(looks_like_iscsi(&good, &frame(3260, 51000), &prefs));
        assert!(!looks_like_iscsi(&good, &frame(51000, 80), &prefs));

        let unknown = Bhs::new(0x1A, flags::FINAL, 1);
        assert!(!looks_like_iscsi(&unknown, &frame(51000, 3260), &prefs));

        let mut huge = good.clone();
        huge.data_length = 512 * 1024;
        assert!(!looks_like_iscsi(&huge, &frame(51000, 3260), &prefs));

        let mut many_ahs = good.clone();
        many_ahs.ahs_length = 17;
        assert!(!looks_like_iscsi(&many_ahs, &frame(51000, 3260), &prefs));

        let no_ports = IscsiPreferences {
            heuristic_ports: false,
            ..IscsiPreferences::default()
        };
        assert!(looks_like_iscsi(&good, &frame(51000, 80), &no_ports));
    }

    #[test]
    fn test_demand_good_f_bit() {
        let prefs = IscsiPreferences {
            demand_good_f_bit: true,
            ..IscsiPreferences::default()
        };
        let nop = Bhs::new(opcode::NOP_OUT, 0, 1);
        assert!(!looks_like_iscsi(&nop, &frame(51000, 3260), &prefs));
        // SCSI Command may clear F when unsolicited data follows
        let cmd = Bhs::new(opcode::SCSI_COMMAND, flags::WRITE, 1);
        assert!(looks_like_iscsi(&cmd, &frame(51000, 3260), &prefs));
    }

    #[test]
    fn test_layout() {
        let mut bhs = Bhs::new(opcode::SCSI_DATA_IN, 0, 1);
        bhs.data_length = 5;
        bhs.ahs_length = 2;

        let plain = PduLayout::new(&bhs, HeaderDigestMode::None, &IscsiPreferences::default());
        assert_eq!(plain.header_end, 56);
        assert_eq!(plain.data_start, 56);
        assert_eq!(plain.padded_len, 8);
        assert_eq!(plain.total, 64);

        let prefs = IscsiPreferences {
            enable_data_digest: true,
            ..IscsiPreferences::default()
        };
        let digests = PduLayout::new(&bhs, HeaderDigestMode::Crc32c, &prefs);
        assert_eq!(digests.data_start, 60);
        assert_eq!(digests.data_digest_len, 4);
        assert_eq!(digests.total, 72);

        // No data digest without data
        bhs.data_length = 0;
        assert_eq!(PduLayout::new(&bhs, HeaderDigestMode::None, &prefs).total, 56);
    }

    #[test]
    fn test_parse_ahs() {
        let mut bytes = vec![0x00, 0x05, ahs_type::BIDIR_READ_LENGTH, 0x00, 0x00, 0x00, 0x10, 0x00];
        bytes.extend_from_slice(&[0x00, 0x09, ahs_type::EXTENDED_CDB, 0x00]);
        bytes.extend_from_slice(&[0xAA; 8]);
        let ahs = parse_ahs(&bytes).unwrap();
        assert_eq!(ahs.len(), 2);
        assert_eq!(ahs[0].ahs_type, ahs_type::BIDIR_READ_LENGTH);
        assert_eq!(&ahs[0].specific[1..5], &[0x00, 0x00, 0x10, 0x00]);
        assert_eq!(ahs[1].specific.len(), 9);

        assert!(matches!(
            parse_ahs(&[0x00, 0x20, 0x01, 0x00]),
            Err(DissectError::InvalidPdu(msg)) if msg.contains("needs 35 bytes")
        ));
        // Trailing bytes too short for an AHS header are ignored
        assert_eq!(parse_ahs(&[0x00, 0x01]).unwrap(), Vec::new());
    }
}
