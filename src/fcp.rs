//! SCSI over Fibre Channel (FCP) information units
//!
//! The FC layer hands over the complete payload of a sequence of FC-4 type
//! SCSI-FCP together with the R_CTL information category, which tells the
//! IU kind. Command state is kept in the exchange's [`ScsiTaskInfo`] so the
//! data and response phases can be interpreted against their command.
//!
//! ```text
//! FCP_CMND:  0 LUN (8) | 8 CRN | 9 task attr | 10 TMF | 11 addl CDB len/RD/WR
//!           12 CDB (16 + 4*addl) | FCP_DL (4) | [FCP_BIDIRECTIONAL_READ_DL (4)]
//! FCP_RSP:   8 retry delay (2) | 10 flags | 11 status | 12 resid (4)
//!           16 FCP_SNS_LEN | 20 FCP_RSP_LEN | 24 response info | sense
//! ```

use crate::buffer::FrameBytes;
use crate::config::ScsiPreferences;
use crate::conversation::Address;
use crate::error::DissectResult;
use crate::scsi::{self, DeviceTypeTable, ScsiCommand, ScsiResponse, ScsiTaskInfo};

/// R_CTL information categories used by FCP
pub mod category {
    pub const SOLICITED_DATA: u8 = 0x01;
    pub const UNSOLICITED_CONTROL: u8 = 0x02;
    pub const SOLICITED_CONTROL: u8 = 0x03;
    pub const UNSOLICITED_DATA: u8 = 0x04;
    pub const DATA_DESCRIPTOR: u8 = 0x05;
    pub const UNSOLICITED_COMMAND: u8 = 0x06;
    pub const COMMAND_STATUS: u8 = 0x07;

    pub const FCP_DATA: u8 = SOLICITED_DATA;
    pub const FCP_XFER_RDY: u8 = DATA_DESCRIPTOR;
    pub const FCP_CMND: u8 = UNSOLICITED_COMMAND;
    pub const FCP_RSP: u8 = COMMAND_STATUS;
}

/// FCP_CMND control byte 11
pub mod cmnd_flags {
    pub const RDDATA: u8 = 0x02;
    pub const WRDATA: u8 = 0x01;
}

/// FCP_RSP flags (byte 10)
pub mod rsp_flags {
    pub const RSP_LEN_VALID: u8 = 0x01;
    pub const SNS_LEN_VALID: u8 = 0x02;
    pub const RESID_OVER: u8 = 0x04;
    pub const RESID_UNDER: u8 = 0x08;
    pub const CONF_REQ: u8 = 0x10;
    pub const BIDI_RSP: u8 = 0x80;
}

const FCP_CMND_MIN: usize = 32;
const FCP_RSP_MIN: usize = 24;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FcpCommand {
    pub lun: u16,
    pub crn: u8,
    pub task_attribute: u8,
    pub task_management: u8,
    pub read: bool,
    pub write: bool,
    pub cdb: Vec<u8>,
    pub data_length: u32,
    pub bidir_read_length: Option<u32>,
    /// Absent for task management requests
    pub scsi: Option<ScsiCommand>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FcpResponse {
    pub flags: u8,
    pub residual: Option<u32>,
    /// RSP_CODE of the response information, when present
    pub response_code: Option<u8>,
    pub scsi: ScsiResponse,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FcpIu {
    Command(FcpCommand),
    Data {
        offset: u32,
        len: usize,
        /// Peripheral type reported by INQUIRY data
        device_type: Option<u8>,
    },
    TransferReady { offset: u32, burst_len: u32 },
    Response(FcpResponse),
    /// Category FCP does not define
    Other(u8),
}

/// Frame context an IU is interpreted in
pub struct FcpContext<'a> {
    pub task: &'a mut ScsiTaskInfo,
    pub devices: &'a mut DeviceTypeTable,
    pub prefs: &'a ScsiPreferences,
    /// SCSI target of the exchange
    pub target: Address,
    /// Frame sent by the exchange responder
    pub responder: bool,
    /// Relative offset from the FC header parameter field
    pub relative_offset: u32,
    pub first_visit: bool,
}

/// Single-level LUN from the first two bytes of the 8-byte LUN field
pub fn lun_from_bytes(lun: &[u8]) -> u16 {
    match lun {
        [hi, lo, ..] => (((*hi & 0x3F) as u16) << 8) | *lo as u16,
        _ => scsi::LUN_UNKNOWN,
    }
}

pub fn dissect(category: u8, payload: &[u8], ctx: FcpContext<'_>) -> DissectResult<FcpIu> {
    let fb = FrameBytes::new(payload);
    match category {
        category::FCP_CMND => dissect_cmnd(&fb, ctx).map(FcpIu::Command),
        category::FCP_DATA => {
            let offset = ctx.relative_offset;
            let device_type = if ctx.responder && ctx.task.read {
                scsi::dissect_data_in(ctx.task, offset, payload)
            } else {
                None
            };
            let learn = ctx.first_visit && ctx.prefs.device_type_override.is_none();
            if let (Some(devtype), true) = (device_type, learn) {
                ctx.devices.record(ctx.target, devtype);
            }
            Ok(FcpIu::Data {
                offset,
                len: payload.len(),
                device_type,
            })
        }
        category::FCP_XFER_RDY => Ok(FcpIu::TransferReady {
            offset: fb.u32(0)?,
            burst_len: fb.u32(4)?,
        }),
        category::FCP_RSP => dissect_rsp(&fb, ctx).map(FcpIu::Response),
        other => {
            log::trace!("FCP IU with R_CTL category 0x{:x} not interpreted", other);
            Ok(FcpIu::Other(other))
        }
    }
}

fn dissect_cmnd(fb: &FrameBytes<'_>, ctx: FcpContext<'_>) -> DissectResult<FcpCommand> {
    fb.ensure(0, FCP_CMND_MIN)?;
    let control = fb.u8(11)?;
    let addl_cdb_len = ((control & 0xFC) >> 2) as usize * 4;
    let cdb = fb.bytes(12, 16 + addl_cdb_len)?;
    let dl_offset = 28 + addl_cdb_len;
    let data_length = fb.u32(dl_offset)?;

    let read = control & cmnd_flags::RDDATA != 0;
    let write = control & cmnd_flags::WRDATA != 0;
    let bidir_read_length = if read && write && fb.has(dl_offset + 4, 4) {
        Some(fb.u32(dl_offset + 4)?)
    } else {
        None
    };
    let lun = lun_from_bytes(fb.bytes(0, 8)?);
    let task_management = fb.u8(10)?;

    if ctx.first_visit {
        ctx.task.lun = lun;
        ctx.task.read = read;
        ctx.task.write = write;
        ctx.task.expected_data_length = data_length;
        ctx.task.bidir_read_length = bidir_read_length.unwrap_or(0);
    }

    let scsi = if task_management == 0 {
        let class = ctx.devices.resolve(
            &ctx.target,
            ctx.prefs.device_type_override,
            ctx.prefs.default_device_type,
        );
        Some(scsi::dissect_command(ctx.task, cdb, class, ctx.first_visit)?)
    } else {
        None
    };

    Ok(FcpCommand {
        lun,
        crn: fb.u8(8)?,
        task_attribute: fb.u8(9)? & 0x07,
        task_management,
        read,
        write,
        cdb: cdb.to_vec(),
        data_length,
        bidir_read_length,
        scsi,
    })
}

fn dissect_rsp(fb: &FrameBytes<'_>, ctx: FcpContext<'_>) -> DissectResult<FcpResponse> {
    fb.ensure(0, FCP_RSP_MIN)?;
    let flags = fb.u8(10)?;
    let status = fb.u8(11)?;

    let residual = if flags & (rsp_flags::RESID_OVER | rsp_flags::RESID_UNDER) != 0 {
        Some(fb.u32(12)?)
    } else {
        None
    };
    let sns_len = if flags & rsp_flags::SNS_LEN_VALID != 0 {
        fb.u32(16)? as usize
    } else {
        0
    };
    let rsp_len = if flags & rsp_flags::RSP_LEN_VALID != 0 {
        fb.u32(20)? as usize
    } else {
        0
    };

    let response_code = if rsp_len >= 4 {
        Some(fb.u8(FCP_RSP_MIN + 3)?)
    } else {
        None
    };
    let sense = fb.bytes(FCP_RSP_MIN + rsp_len, sns_len)?;
    let scsi = scsi::dissect_response(Some(ctx.task), status, sense)?;

    Ok(FcpResponse {
        flags,
        residual,
        response_code,
        scsi,
    })
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scsi::{peripheral_type, scsi_status, sense_key, DeviceClass, SenseData};

    fn target() -> Address {
        Address::fc(0x010200)
    }

    fn cmnd(lun: u8, control: u8, cdb: &[u8], dl: u32) -> Vec<u8> {
        let mut iu = vec![0u8; 32];
        iu[1] = lun;
        iu[11] = control;
        iu[12..12 + cdb.len()].copy_from_slice(cdb);
        iu[28..32].copy_from_slice(&dl.to_be_bytes());
        iu
    }

    fn context<'a>(
        task: &'a mut ScsiTaskInfo,
        devices: &'a mut DeviceTypeTable,
        prefs: &'a ScsiPreferences,
        responder: bool,
        first_visit: bool,
    ) -> FcpContext<'a> {
        FcpContext {
            task,
            devices,
            prefs,
            target: target(),
            responder,
            relative_offset: 0,
            first_visit,
        }
    }

    fn run(
        category: u8,
        payload: &[u8],
        task: &mut ScsiTaskInfo,
        devices: &mut DeviceTypeTable,
        responder: bool,
        first_visit: bool,
    ) -> FcpIu {
        let prefs = ScsiPreferences::default();
        dissect(category, payload, context(task, devices, &prefs, responder, first_visit)).unwrap()
    }

    #[test]
    fn test_lun_from_bytes() {
        assert_eq!(lun_from_bytes(&[0x00, 0x05, 0, 0, 0, 0, 0, 0]), 5);
        assert_eq!(lun_from_bytes(&[0x40, 0x01, 0, 0, 0, 0, 0, 0]), 0x0001);
        assert_eq!(lun_from_bytes(&[0x01, 0x02]), 0x0102);
        assert_eq!(lun_from_bytes(&[0x01]), scsi::LUN_UNKNOWN);
    }

    #[test]
    fn test_cmnd_records_task() {
        let mut task = ScsiTaskInfo::default();
        let mut devices = DeviceTypeTable::new();
        let iu = cmnd(3, cmnd_flags::RDDATA, &[0x12, 0, 0, 0, 96, 0], 96);

        match run(category::FCP_CMND, &iu, &mut task, &mut devices, false, true) {
            FcpIu::Command(c) => {
                assert_eq!(c.lun, 3);
                assert!(c.read && !c.write);
                assert_eq!(c.data_length, 96);
                let scsi = c.scsi.unwrap();
                assert_eq!(scsi.name, "INQUIRY");
                assert_eq!(scsi.class, DeviceClass::Block);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(task.lun, 3);
        assert!(task.read);
        assert_eq!(task.expected_data_length, 96);
        assert_eq!(task.opcode(), Some(0x12));
    }

    #[test]
    fn test_cmnd_revisit_does_not_record() {
        let mut task = ScsiTaskInfo::default();
        let mut devices = DeviceTypeTable::new();
        let iu = cmnd(3, cmnd_flags::WRDATA, &[0x2A, 0, 0, 0, 0, 0, 0, 0, 8, 0], 4096);
        run(category::FCP_CMND, &iu, &mut task, &mut devices, false, false);
        assert_eq!(task, ScsiTaskInfo::default());
    }

    #[test]
    fn test_cmnd_additional_cdb_and_bidir() {
        let mut iu = vec![0u8; 12 + 16 + 8 + 4 + 4];
        iu[11] = (2 << 2) | cmnd_flags::RDDATA | cmnd_flags::WRDATA;
        iu[12] = 0x7F;
        iu[36..40].copy_from_slice(&512u32.to_be_bytes());
        iu[40..44].copy_from_slice(&256u32.to_be_bytes());

        let mut task = ScsiTaskInfo::default();
        let mut devices = DeviceTypeTable::new();
        match run(category::FCP_CMND, &iu, &mut task, &mut devices, false, true) {
            FcpIu::Command(c) => {
                assert_eq!(c.cdb.len(), 24);
                assert_eq!(c.data_length, 512);
                assert_eq!(c.bidir_read_length, Some(256));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(task.bidir_read_length, 256);
    }

    #[test]
    fn test_short_cmnd_is_bounds_error() {
        let mut task = ScsiTaskInfo::default();
        let mut devices = DeviceTypeTable::new();
        let prefs = ScsiPreferences::default();
        let result = dissect(
            category::FCP_CMND,
            &[0u8; 20],
            context(&mut task, &mut devices, &prefs, false, true),
        );
        assert!(result.is_err());
        assert_eq!(task, ScsiTaskInfo::default());
    }

    #[test]
    fn test_inquiry_data_records_device_type() {
        let mut task = ScsiTaskInfo::default();
        let mut devices = DeviceTypeTable::new();
        let iu = cmnd(0, cmnd_flags::RDDATA, &[0x12, 0, 0, 0, 36, 0], 36);
        run(category::FCP_CMND, &iu, &mut task, &mut devices, false, true);

        let mut data = vec![0u8; 36];
        data[0] = peripheral_type::TAPE;
        match run(category::FCP_DATA, &data, &mut task, &mut devices, true, true) {
            FcpIu::Data { device_type, len, .. } => {
                assert_eq!(device_type, Some(peripheral_type::TAPE));
                assert_eq!(len, 36);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(devices.lookup(&target()), Some(peripheral_type::TAPE));
    }

    #[test]
    fn test_override_suppresses_device_type_learning() {
        let mut task = ScsiTaskInfo::default();
        let mut devices = DeviceTypeTable::new();
        let prefs = ScsiPreferences {
            device_type_override: Some(peripheral_type::CHANGER),
            ..ScsiPreferences::default()
        };
        let iu = cmnd(0, cmnd_flags::RDDATA, &[0x12, 0, 0, 0, 36, 0], 36);
        let ctx = context(&mut task, &mut devices, &prefs, false, true);
        dissect(category::FCP_CMND, &iu, ctx).unwrap();

        let mut data = vec![0u8; 36];
        data[0] = peripheral_type::TAPE;
        let ctx = context(&mut task, &mut devices, &prefs, true, true);
        match dissect(category::FCP_DATA, &data, ctx).unwrap() {
            FcpIu::Data { device_type, .. } => assert_eq!(device_type, Some(peripheral_type::TAPE)),
            other => panic!("unexpected {:?}", other),
        }
        assert!(devices.is_empty());
    }

    #[test]
    fn test_cmnd_revisit_keeps_first_class() {
        let mut task = ScsiTaskInfo::default();
        let mut devices = DeviceTypeTable::new();
        let iu = cmnd(0, 0, &[0x01, 0, 0, 0, 0, 0], 0);
        run(category::FCP_CMND, &iu, &mut task, &mut devices, false, true);
        assert_eq!(task.device_class, Some(DeviceClass::Block));

        devices.record(target(), peripheral_type::TAPE);
        match run(category::FCP_CMND, &iu, &mut task, &mut devices, false, false) {
            FcpIu::Command(c) => {
                let scsi = c.scsi.unwrap();
                assert_eq!(scsi.class, DeviceClass::Block);
                assert_eq!(scsi.name, "Unknown SCSI command");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_xfer_rdy() {
        let mut task = ScsiTaskInfo::default();
        let mut devices = DeviceTypeTable::new();
        let mut iu = vec![0u8; 12];
        iu[4..8].copy_from_slice(&8192u32.to_be_bytes());
        assert_eq!(
            run(category::FCP_XFER_RDY, &iu, &mut task, &mut devices, true, true),
            FcpIu::TransferReady {
                offset: 0,
                burst_len: 8192
            }
        );
    }

    #[test]
    fn test_rsp_with_sense() {
        let mut task = ScsiTaskInfo::default();
        task.opcode = 0x28;
        let mut devices = DeviceTypeTable::new();

        let sense = SenseData::new(sense_key::MEDIUM_ERROR, 0x11, 0x00).to_bytes();
        let mut iu = vec![0u8; 24];
        iu[10] = rsp_flags::SNS_LEN_VALID | rsp_flags::RESID_UNDER;
        iu[11] = scsi_status::CHECK_CONDITION;
        iu[12..16].copy_from_slice(&512u32.to_be_bytes());
        iu[16..20].copy_from_slice(&(sense.len() as u32).to_be_bytes());
        iu.extend_from_slice(&sense);

        match run(category::FCP_RSP, &iu, &mut task, &mut devices, true, true) {
            FcpIu::Response(r) => {
                assert_eq!(r.residual, Some(512));
                assert_eq!(r.response_code, None);
                assert_eq!(r.scsi.status, scsi_status::CHECK_CONDITION);
                assert_eq!(r.scsi.opcode, Some(0x28));
                assert_eq!(r.scsi.sense.unwrap().sense_key, sense_key::MEDIUM_ERROR);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_rsp_info_precedes_sense() {
        let mut task = ScsiTaskInfo::default();
        let mut devices = DeviceTypeTable::new();
        let sense = SenseData::new(sense_key::NOT_READY, 0x04, 0x01).to_bytes();
        let mut iu = vec![0u8; 24];
        iu[10] = rsp_flags::SNS_LEN_VALID | rsp_flags::RSP_LEN_VALID;
        iu[11] = scsi_status::CHECK_CONDITION;
        iu[16..20].copy_from_slice(&(sense.len() as u32).to_be_bytes());
        iu[20..24].copy_from_slice(&8u32.to_be_bytes());
        iu.extend_from_slice(&[0, 0, 0, 0x04, 0, 0, 0, 0]);
        iu.extend_from_slice(&sense);

        match run(category::FCP_RSP, &iu, &mut task, &mut devices, true, true) {
            FcpIu::Response(r) => {
                assert_eq!(r.response_code, Some(0x04));
                assert_eq!(r.scsi.sense.unwrap().asc, 0x04);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
