//! Analysis session: owner of every correlation table
//!
//! One [`AnalysisSession`] covers one capture. The host calls
//! [`AnalysisSession::dissect_fc_frame`] or [`AnalysisSession::dissect_iscsi`]
//! once per frame in capture order with `first_visit` set, and may call them
//! again for any frame afterwards with `first_visit` cleared to get the same
//! results without changing any table.

use crate::config::{IscsiPreferences, Preferences, ProtocolVersion};
use crate::conversation::ConversationTable;
use crate::error::DissectResult;
use crate::exchange::ExchangeTable;
use crate::fc::{self, FcDissection, FcEncapsulation};
use crate::frame::FrameInfo;
use crate::iscsi::{self, IscsiDissection};
use crate::reassembly::SequenceReassembler;
use crate::scsi::DeviceTypeTable;
use crate::session::SessionTable;
use crate::task::TaskCorrelator;

#[derive(Debug)]
pub struct AnalysisSession {
    pub(crate) prefs: Preferences,
    pub(crate) conversations: ConversationTable,
    pub(crate) exchanges: ExchangeTable,
    pub(crate) tasks: TaskCorrelator,
    pub(crate) sessions: SessionTable,
    pub(crate) sequences: SequenceReassembler,
    pub(crate) devices: DeviceTypeTable,
}

impl Default for AnalysisSession {
    fn default() -> Self {
        Self::new(Preferences::default())
    }
}

impl AnalysisSession {
    /// Session with `prefs` taken as given
    pub fn new(prefs: Preferences) -> Self {
        AnalysisSession {
            prefs,
            conversations: ConversationTable::new(),
            exchanges: ExchangeTable::new(),
            tasks: TaskCorrelator::new(),
            sessions: SessionTable::new(),
            sequences: SequenceReassembler::new(),
            devices: DeviceTypeTable::new(),
        }
    }

    /// Create a new builder for configuring a session
    pub fn builder() -> AnalysisSessionBuilder {
        AnalysisSessionBuilder::new()
    }

    /// Drop all state before a new capture; preferences are kept
    pub fn reset(&mut self) {
        log::debug!(
            "Resetting analysis session ({} conversations, {} exchanges, {} tasks)",
            self.conversations.len(),
            self.exchanges.len(),
            self.tasks.len()
        );
        *self = Self::new(self.prefs.clone());
    }

    /// Dissect one Fibre Channel frame, header included
    pub fn dissect_fc_frame(
        &mut self,
        frame: &FrameInfo,
        data: &[u8],
        encap: FcEncapsulation,
    ) -> DissectResult<FcDissection> {
        fc::dissect_frame(self, frame, data, encap)
    }

    /// Dissect the TCP payload of one segment as iSCSI
    pub fn dissect_iscsi(
        &mut self,
        frame: &FrameInfo,
        data: &[u8],
    ) -> DissectResult<IscsiDissection> {
        iscsi::dissect_segment(self, frame, data)
    }

    pub fn preferences(&self) -> &Preferences {
        &self.prefs
    }

    pub fn conversations(&self) -> &ConversationTable {
        &self.conversations
    }

    pub fn exchanges(&self) -> &ExchangeTable {
        &self.exchanges
    }

    pub fn tasks(&self) -> &TaskCorrelator {
        &self.tasks
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub fn sequences(&self) -> &SequenceReassembler {
        &self.sequences
    }

    pub fn devices(&self) -> &DeviceTypeTable {
        &self.devices
    }
}

/// Builder for configuring an analysis session
pub struct AnalysisSessionBuilder {
    prefs: Preferences,
}

impl AnalysisSessionBuilder {
    fn new() -> Self {
        Self {
            prefs: Preferences::default(),
        }
    }

    /// Start from a complete set of preferences
    pub fn preferences(mut self, prefs: Preferences) -> Self {
        self.prefs = prefs;
        self
    }

    /// Enable or disable FC sequence reassembly (default: enabled)
    pub fn fc_reassembly(mut self, enabled: bool) -> Self {
        self.prefs.fc.reassemble = enabled;
        self
    }

    /// Payload size of all but the last frame of a sequence (default: 1024)
    pub fn max_frame_size(mut self, size: u32) -> Self {
        self.prefs.fc.max_frame_size = size;
        self
    }

    pub fn iscsi(mut self, prefs: IscsiPreferences) -> Self {
        self.prefs.iscsi = prefs;
        self
    }

    /// iSCSI revision to interpret captures as (default: RFC 3720)
    pub fn protocol_version(mut self, version: ProtocolVersion) -> Self {
        self.prefs.iscsi.protocol_version = version;
        self
    }

    /// TCP port of iSCSI targets (default: 3260)
    pub fn target_port(mut self, port: u16) -> Self {
        self.prefs.iscsi.target_port = port;
        self
    }

    pub fn data_digest(mut self, enabled: bool) -> Self {
        self.prefs.iscsi.enable_data_digest = enabled;
        self
    }

    /// Peripheral device type assumed for unknown targets (default: disk)
    pub fn default_device_type(mut self, devtype: u8) -> Self {
        self.prefs.scsi.default_device_type = devtype;
        self
    }

    /// Interpret every target as `devtype`, ignoring INQUIRY data
    pub fn device_type_override(mut self, devtype: u8) -> Self {
        self.prefs.scsi.device_type_override = Some(devtype);
        self
    }

    /// Build the session, rejecting unusable preferences
    pub fn build(self) -> DissectResult<AnalysisSession> {
        self.prefs.validate()?;
        Ok(AnalysisSession::new(self.prefs))
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotation::Annotation;
    use crate::conversation::Endpoint;
    use crate::error::DissectError;
    use crate::fc::Delimiters;
    use crate::scsi::peripheral_type;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    #[test]
    fn test_builder_defaults() {
        let session = AnalysisSession::builder().build().unwrap();
        assert_eq!(session.preferences(), &Preferences::default());
        assert!(session.conversations().is_empty());
    }

    #[test]
    fn test_builder_validation() {
        let result = AnalysisSession::builder().max_frame_size(0).build();
        assert!(matches!(result, Err(DissectError::Config(_))));

        let result = AnalysisSession::builder().max_frame_size(100_000).build();
        assert!(matches!(result, Err(DissectError::Config(_))));

        let result = AnalysisSession::builder().default_device_type(0x20).build();
        assert!(matches!(result, Err(DissectError::Config(_))));

        let session = AnalysisSession::builder()
            .max_frame_size(2048)
            .target_port(3261)
            .protocol_version(ProtocolVersion::Draft09)
            .device_type_override(peripheral_type::TAPE)
            .build()
            .unwrap();
        assert_eq!(session.preferences().fc.max_frame_size, 2048);
        assert_eq!(session.preferences().iscsi.target_port, 3261);
        assert_eq!(session.preferences().scsi.device_type_override, Some(peripheral_type::TAPE));
    }

    fn fc_frame(number: u32, f_ctl: u32, seq_cnt: u16, payload: &[u8]) -> Vec<u8> {
        let mut f = vec![0u8; 24];
        f[0] = 0x01;
        f[1..4].copy_from_slice(&[0x01, 0x02, 0x00]);
        f[5..8].copy_from_slice(&[0x01, 0x03, 0x00]);
        f[8] = 0x08;
        f[9..12].copy_from_slice(&f_ctl.to_be_bytes()[1..]);
        f[14..16].copy_from_slice(&seq_cnt.to_be_bytes());
        f[16..18].copy_from_slice(&(0x100 + number as u16).to_be_bytes());
        f.extend_from_slice(payload);
        f
    }

    fn info(number: u32) -> FrameInfo {
        FrameInfo::new(
            number,
            Duration::from_millis(number as u64),
            Endpoint::new(Ipv4Addr::new(0, 0, 0, 0), 0),
            Endpoint::new(Ipv4Addr::new(0, 0, 0, 0), 0),
        )
    }

    #[test]
    fn test_reset_clears_tables_and_keeps_prefs() {
        let mut session = AnalysisSession::builder().max_frame_size(512).build().unwrap();
        let frame = fc_frame(1, 0x29_0000, 0, &[0u8; 8]);
        let encap = FcEncapsulation {
            delimiters: Delimiters {
                first_of_sequence: true,
                last_of_sequence: true,
            },
            trailer_len: 0,
        };
        session.dissect_fc_frame(&info(1), &frame, encap).unwrap();
        assert_eq!(session.exchanges().len(), 1);
        assert_eq!(session.conversations().len(), 1);

        session.reset();
        assert!(session.exchanges().is_empty());
        assert!(session.conversations().is_empty());
        let conv = crate::conversation::ConversationId(0);
        assert!(session.sequences().tracker().base(conv).is_none());
        assert_eq!(session.preferences().fc.max_frame_size, 512);
    }

    #[test]
    fn test_bounds_fault_leaves_tables_untouched() {
        let mut session = AnalysisSession::default();
        let frame = fc_frame(1, 0x20_0000, 0, &[0u8; 2]);
        let encap = FcEncapsulation {
            delimiters: Delimiters::default(),
            trailer_len: 8,
        };
        let err = session.dissect_fc_frame(&info(1), &frame, encap).unwrap_err();
        assert!(matches!(err, DissectError::Bounds { needed: 32, available: 26, .. }));
        assert!(session.conversations().is_empty());
        assert!(session.exchanges().is_empty());
        assert_eq!(session.sequences().fragments().pending_len(), 0);
    }

    #[test]
    fn test_fc_exchange_annotations() {
        let mut session = AnalysisSession::default();
        let single = FcEncapsulation {
            delimiters: Delimiters {
                first_of_sequence: true,
                last_of_sequence: true,
            },
            trailer_len: 0,
        };
        // Same OX_ID (number 0 -> 0x100) for both frames
        let first = fc_frame(0, 0x20_0000, 0, &[0u8; 4]);
        let mut last = fc_frame(0, 0x10_0000, 1, &[0u8; 4]);
        last[0] = 0x04;

        session.dissect_fc_frame(&info(3), &first, single).unwrap();
        let d = session.dissect_fc_frame(&info(8), &last, single).unwrap();
        assert!(d.annotations.contains(&Annotation::ExchangeFirstFrame(3)));
        assert!(d.annotations.contains(&Annotation::ExchangeTime(Duration::from_millis(5))));
    }
}
