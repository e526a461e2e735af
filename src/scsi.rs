//! SCSI command/response interpretation and device-type inference
//!
//! The transport dissectors (iSCSI, FCP) hand this module CDBs, Data-In
//! payloads and status/sense bytes together with the [`ScsiTaskInfo`] of the
//! task they belong to. Opcodes are interpreted per device class, where the
//! class comes from the [`DeviceTypeTable`] populated by INQUIRY responses.

use crate::buffer::FrameBytes;
use crate::conversation::Address;
use crate::error::DissectResult;
use byteorder::{BigEndian, ByteOrder};
use std::collections::HashMap;
use std::fmt;

/// LUN not (yet) known for a task
pub const LUN_UNKNOWN: u16 = 0xFFFF;

/// Opcode not (yet) known for a task
pub const OPCODE_UNKNOWN: u16 = 0xFFFF;

/// Peripheral device types (SPC, INQUIRY byte 0 bits 0-4)
pub mod peripheral_type {
    pub const DISK: u8 = 0x00;
    pub const TAPE: u8 = 0x01;
    pub const PRINTER: u8 = 0x02;
    pub const PROCESSOR: u8 = 0x03;
    pub const WORM: u8 = 0x04;
    pub const CDROM: u8 = 0x05;
    pub const SCANNER: u8 = 0x06;
    pub const OPTICAL: u8 = 0x07;
    pub const CHANGER: u8 = 0x08;
    pub const COMM: u8 = 0x09;
    pub const RAID: u8 = 0x0C;
    pub const ENCLOSURE: u8 = 0x0D;
    pub const RBC: u8 = 0x0E;
    pub const OCRW: u8 = 0x0F;
    pub const BRIDGE: u8 = 0x10;
    pub const OSD: u8 = 0x11;
    /// Unknown or no device type; reported for a LUN that does not exist
    pub const NO_LUN: u8 = 0x1F;
}

/// SCSI command opcodes shared by every device class (SPC)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScsiOpcode {
    TestUnitReady = 0x00,
    RequestSense = 0x03,
    Inquiry = 0x12,
    ModeSelect6 = 0x15,
    ModeSense6 = 0x1A,
    ReceiveDiagnostic = 0x1C,
    SendDiagnostic = 0x1D,
    LogSelect = 0x4C,
    LogSense = 0x4D,
    ModeSelect10 = 0x55,
    ModeSense10 = 0x5A,
    PersistentReserveIn = 0x5E,
    PersistentReserveOut = 0x5F,
    VariableLength = 0x7F,
    ReportLuns = 0xA0,
    MaintenanceIn = 0xA3,
}

impl ScsiOpcode {
    pub fn from_u8(val: u8) -> Option<Self> {
        match val {
            0x00 => Some(ScsiOpcode::TestUnitReady),
            0x03 => Some(ScsiOpcode::RequestSense),
            0x12 => Some(ScsiOpcode::Inquiry),
            0x15 => Some(ScsiOpcode::ModeSelect6),
            0x1A => Some(ScsiOpcode::ModeSense6),
            0x1C => Some(ScsiOpcode::ReceiveDiagnostic),
            0x1D => Some(ScsiOpcode::SendDiagnostic),
            0x4C => Some(ScsiOpcode::LogSelect),
            0x4D => Some(ScsiOpcode::LogSense),
            0x55 => Some(ScsiOpcode::ModeSelect10),
            0x5A => Some(ScsiOpcode::ModeSense10),
            0x5E => Some(ScsiOpcode::PersistentReserveIn),
            0x5F => Some(ScsiOpcode::PersistentReserveOut),
            0x7F => Some(ScsiOpcode::VariableLength),
            0xA0 => Some(ScsiOpcode::ReportLuns),
            0xA3 => Some(ScsiOpcode::MaintenanceIn),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ScsiOpcode::TestUnitReady => "TEST UNIT READY",
            ScsiOpcode::RequestSense => "REQUEST SENSE",
            ScsiOpcode::Inquiry => "INQUIRY",
            ScsiOpcode::ModeSelect6 => "MODE SELECT(6)",
            ScsiOpcode::ModeSense6 => "MODE SENSE(6)",
            ScsiOpcode::ReceiveDiagnostic => "RECEIVE DIAGNOSTIC RESULTS",
            ScsiOpcode::SendDiagnostic => "SEND DIAGNOSTIC",
            ScsiOpcode::LogSelect => "LOG SELECT",
            ScsiOpcode::LogSense => "LOG SENSE",
            ScsiOpcode::ModeSelect10 => "MODE SELECT(10)",
            ScsiOpcode::ModeSense10 => "MODE SENSE(10)",
            ScsiOpcode::PersistentReserveIn => "PERSISTENT RESERVE IN",
            ScsiOpcode::PersistentReserveOut => "PERSISTENT RESERVE OUT",
            ScsiOpcode::VariableLength => "VARIABLE LENGTH CDB",
            ScsiOpcode::ReportLuns => "REPORT LUNS",
            ScsiOpcode::MaintenanceIn => "MAINTENANCE IN",
        }
    }
}

/// Device classes with their own command sets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    /// SBC: disks, optical, RBC
    Block,
    /// SSC: tape
    Sequential,
    /// SMC: media changers
    Changer,
    /// OSD object storage
    Osd,
    /// Anything else; only SPC commands are named
    Generic,
}

impl DeviceClass {
    pub fn from_peripheral_type(devtype: u8) -> Self {
        match devtype & 0x1F {
            peripheral_type::DISK
            | peripheral_type::WORM
            | peripheral_type::CDROM
            | peripheral_type::OPTICAL
            | peripheral_type::RBC
            | peripheral_type::OCRW => DeviceClass::Block,
            peripheral_type::TAPE => DeviceClass::Sequential,
            peripheral_type::CHANGER => DeviceClass::Changer,
            peripheral_type::OSD => DeviceClass::Osd,
            _ => DeviceClass::Generic,
        }
    }

    /// Name of `opcode` for this class, falling back to the SPC table
    pub fn opcode_name(&self, opcode: u8) -> &'static str {
        let specific = match self {
            DeviceClass::Block => block_opcode_name(opcode),
            DeviceClass::Sequential => sequential_opcode_name(opcode),
            DeviceClass::Changer => changer_opcode_name(opcode),
            DeviceClass::Osd if opcode == 0x7F => Some("OSD"),
            DeviceClass::Osd | DeviceClass::Generic => None,
        };
        specific
            .or_else(|| ScsiOpcode::from_u8(opcode).map(|op| op.name()))
            .unwrap_or("Unknown SCSI command")
    }

    /// Transfer length in blocks (or bytes for fixed=0 tape) for read/write CDBs
    fn transfer_length(&self, cdb: &[u8]) -> Option<u32> {
        let opcode = *cdb.first()?;
        match (self, opcode) {
            (DeviceClass::Block, 0x08) | (DeviceClass::Block, 0x0A) => {
                let len = *cdb.get(4)? as u32;
                Some(if len == 0 { 256 } else { len })
            }
            (DeviceClass::Block, 0x28 | 0x2A | 0x2F) => {
                Some(BigEndian::read_u16(cdb.get(7..9)?) as u32)
            }
            (DeviceClass::Block, 0xA8) | (DeviceClass::Block, 0xAA) => {
                Some(BigEndian::read_u32(cdb.get(6..10)?))
            }
            (DeviceClass::Block, 0x88 | 0x8A | 0x8F) => {
                Some(BigEndian::read_u32(cdb.get(10..14)?))
            }
            (DeviceClass::Sequential, 0x08) | (DeviceClass::Sequential, 0x0A) => {
                Some(BigEndian::read_u24(cdb.get(2..5)?))
            }
            _ => None,
        }
    }
}

fn block_opcode_name(opcode: u8) -> Option<&'static str> {
    Some(match opcode {
        0x04 => "FORMAT UNIT",
        0x08 => "READ(6)",
        0x0A => "WRITE(6)",
        0x1B => "START STOP UNIT",
        0x1E => "PREVENT ALLOW MEDIUM REMOVAL",
        0x25 => "READ CAPACITY(10)",
        0x28 => "READ(10)",
        0x2A => "WRITE(10)",
        0x2F => "VERIFY(10)",
        0x35 => "SYNCHRONIZE CACHE(10)",
        0x42 => "UNMAP",
        0x88 => "READ(16)",
        0x8A => "WRITE(16)",
        0x8F => "VERIFY(16)",
        0x91 => "SYNCHRONIZE CACHE(16)",
        0x9E => "SERVICE ACTION IN(16)",
        0xA8 => "READ(12)",
        0xAA => "WRITE(12)",
        _ => return None,
    })
}

fn sequential_opcode_name(opcode: u8) -> Option<&'static str> {
    Some(match opcode {
        0x01 => "REWIND",
        0x05 => "READ BLOCK LIMITS",
        0x08 => "READ(6)",
        0x0A => "WRITE(6)",
        0x10 => "WRITE FILEMARKS(6)",
        0x11 => "SPACE(6)",
        0x19 => "ERASE(6)",
        0x1B => "LOAD UNLOAD",
        0x2B => "LOCATE(10)",
        0x34 => "READ POSITION",
        0x92 => "LOCATE(16)",
        _ => return None,
    })
}

fn changer_opcode_name(opcode: u8) -> Option<&'static str> {
    Some(match opcode {
        0x07 => "INITIALIZE ELEMENT STATUS",
        0x1E => "PREVENT ALLOW MEDIUM REMOVAL",
        0x2B => "POSITION TO ELEMENT",
        0xA5 => "MOVE MEDIUM",
        0xA6 => "EXCHANGE MEDIUM",
        0xB8 => "READ ELEMENT STATUS",
        _ => return None,
    })
}

/// OSD-1 service actions carried in a variable length CDB
pub fn osd_service_action_name(service_action: u16) -> &'static str {
    match service_action {
        0x8801 => "FORMAT OSD",
        0x8802 => "CREATE",
        0x8803 => "LIST",
        0x8805 => "READ",
        0x8806 => "WRITE",
        0x8807 => "APPEND",
        0x8808 => "FLUSH",
        0x880A => "REMOVE",
        0x880B => "CREATE PARTITION",
        0x880C => "REMOVE PARTITION",
        0x880E => "GET ATTRIBUTES",
        0x880F => "SET ATTRIBUTES",
        _ => "Unknown OSD service action",
    }
}

/// SCSI status codes
pub mod scsi_status {
    pub const GOOD: u8 = 0x00;
    pub const CHECK_CONDITION: u8 = 0x02;
    pub const CONDITION_MET: u8 = 0x04;
    pub const BUSY: u8 = 0x08;
    pub const RESERVATION_CONFLICT: u8 = 0x18;
    pub const TASK_SET_FULL: u8 = 0x28;
    pub const ACA_ACTIVE: u8 = 0x30;
    pub const TASK_ABORTED: u8 = 0x40;
}

pub fn status_name(status: u8) -> &'static str {
    match status {
        scsi_status::GOOD => "Good",
        scsi_status::CHECK_CONDITION => "Check Condition",
        scsi_status::CONDITION_MET => "Condition Met",
        scsi_status::BUSY => "Busy",
        scsi_status::RESERVATION_CONFLICT => "Reservation Conflict",
        scsi_status::TASK_SET_FULL => "Task Set Full",
        scsi_status::ACA_ACTIVE => "ACA Active",
        scsi_status::TASK_ABORTED => "Task Aborted",
        _ => "Unknown",
    }
}

/// SCSI sense key codes
pub mod sense_key {
    pub const NO_SENSE: u8 = 0x00;
    pub const RECOVERED_ERROR: u8 = 0x01;
    pub const NOT_READY: u8 = 0x02;
    pub const MEDIUM_ERROR: u8 = 0x03;
    pub const HARDWARE_ERROR: u8 = 0x04;
    pub const ILLEGAL_REQUEST: u8 = 0x05;
    pub const UNIT_ATTENTION: u8 = 0x06;
    pub const DATA_PROTECT: u8 = 0x07;
    pub const BLANK_CHECK: u8 = 0x08;
    pub const ABORTED_COMMAND: u8 = 0x0B;
    pub const VOLUME_OVERFLOW: u8 = 0x0D;
    pub const MISCOMPARE: u8 = 0x0E;
}

pub fn sense_key_name(key: u8) -> &'static str {
    match key {
        sense_key::NO_SENSE => "No Sense",
        sense_key::RECOVERED_ERROR => "Recovered Error",
        sense_key::NOT_READY => "Not Ready",
        sense_key::MEDIUM_ERROR => "Medium Error",
        sense_key::HARDWARE_ERROR => "Hardware Error",
        sense_key::ILLEGAL_REQUEST => "Illegal Request",
        sense_key::UNIT_ATTENTION => "Unit Attention",
        sense_key::DATA_PROTECT => "Data Protect",
        sense_key::BLANK_CHECK => "Blank Check",
        sense_key::ABORTED_COMMAND => "Aborted Command",
        sense_key::VOLUME_OVERFLOW => "Volume Overflow",
        sense_key::MISCOMPARE => "Miscompare",
        _ => "Reserved",
    }
}

/// Decoded sense data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenseData {
    /// 0x70/0x71 fixed format, 0x72/0x73 descriptor format
    pub response_code: u8,
    pub sense_key: u8,
    pub asc: u8,  // Additional Sense Code
    pub ascq: u8, // Additional Sense Code Qualifier
    pub information: u32,
}

impl SenseData {
    pub fn new(sense_key: u8, asc: u8, ascq: u8) -> Self {
        SenseData {
            response_code: 0x70,
            sense_key,
            asc,
            ascq,
            information: 0,
        }
    }

    pub fn with_info(mut self, info: u32) -> Self {
        self.information = info;
        self
    }

    pub fn is_descriptor_format(&self) -> bool {
        matches!(self.response_code, 0x72 | 0x73)
    }

    /// Decode fixed or descriptor format sense data
    pub fn from_bytes(data: &[u8]) -> DissectResult<Self> {
        let fb = FrameBytes::new(data);
        let response_code = fb.u8(0)? & 0x7F;
        match response_code {
            0x72 | 0x73 => Ok(SenseData {
                response_code,
                sense_key: fb.u8(1)? & 0x0F,
                asc: fb.u8(2)?,
                ascq: fb.u8(3)?,
                information: 0,
            }),
            _ => {
                // Fixed format: ASC/ASCQ sit at 12/13, absent in truncated sense
                let information = if fb.has(3, 4) { fb.u32(3)? } else { 0 };
                Ok(SenseData {
                    response_code,
                    sense_key: fb.u8(2)? & 0x0F,
                    asc: if fb.has(12, 1) { fb.u8(12)? } else { 0 },
                    ascq: if fb.has(13, 1) { fb.u8(13)? } else { 0 },
                    information,
                })
            }
        }
    }

    /// Serialize to fixed format sense data (18 bytes)
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut data = vec![0u8; 18];
        data[0] = 0x70;
        data[2] = self.sense_key & 0x0F;
        BigEndian::write_u32(&mut data[3..7], self.information);
        data[7] = 10; // Remaining bytes after this field
        data[12] = self.asc;
        data[13] = self.ascq;
        data
    }
}

impl fmt::Display for SenseData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (ASC 0x{:02x}, ASCQ 0x{:02x})",
            sense_key_name(self.sense_key),
            self.asc,
            self.ascq
        )
    }
}

/// Device-class specific data kept with a task between its phases
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskExtra {
    Osd { service_action: u16, cdb_format: u8 },
}

/// SCSI-level state of one task, shared by the FC and iSCSI records
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScsiTaskInfo {
    pub lun: u16,
    pub opcode: u16,
    pub read: bool,
    pub write: bool,
    /// Expected data transfer length from the transport command
    pub expected_data_length: u32,
    /// Expected read length of a bidirectional command
    pub bidir_read_length: u32,
    /// Allocation length from the CDB, consulted in the data phase
    pub alloc_len: u32,
    pub extra: Option<TaskExtra>,
    /// Class the command was interpreted as on its first visit
    pub device_class: Option<DeviceClass>,
}

impl Default for ScsiTaskInfo {
    fn default() -> Self {
        ScsiTaskInfo {
            lun: LUN_UNKNOWN,
            opcode: OPCODE_UNKNOWN,
            read: false,
            write: false,
            expected_data_length: 0,
            bidir_read_length: 0,
            alloc_len: 0,
            extra: None,
            device_class: None,
        }
    }
}

impl ScsiTaskInfo {
    pub fn opcode(&self) -> Option<u8> {
        if self.opcode == OPCODE_UNKNOWN {
            None
        } else {
            Some(self.opcode as u8)
        }
    }
}

/// Per-target cache of peripheral device types learned from INQUIRY data
#[derive(Debug, Default)]
pub struct DeviceTypeTable {
    types: HashMap<Address, u8>,
}

impl DeviceTypeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember the type reported by `target`
    ///
    /// An existing entry is never replaced by [`peripheral_type::NO_LUN`]: a
    /// query for a missing LUN must not clobber what a real LUN reported.
    pub fn record(&mut self, target: Address, devtype: u8) {
        let devtype = devtype & 0x1F;
        match self.types.get_mut(&target) {
            Some(existing) => {
                if devtype != peripheral_type::NO_LUN && *existing != devtype {
                    log::debug!(
                        "Device type of {} changes 0x{:02x} -> 0x{:02x}",
                        target,
                        existing,
                        devtype
                    );
                    *existing = devtype;
                }
            }
            None => {
                log::debug!("Device type of {} is 0x{:02x}", target, devtype);
                self.types.insert(target, devtype);
            }
        }
    }

    pub fn lookup(&self, target: &Address) -> Option<u8> {
        self.types.get(target).copied()
    }

    /// Class to interpret commands for `target` with
    pub fn resolve(&self, target: &Address, hint: Option<u8>, default: u8) -> DeviceClass {
        let devtype = hint.or_else(|| self.lookup(target)).unwrap_or(default);
        DeviceClass::from_peripheral_type(devtype)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

/// Interpretation of one CDB
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScsiCommand {
    pub opcode: u8,
    pub name: &'static str,
    pub class: DeviceClass,
    pub transfer_length: Option<u32>,
    pub alloc_len: Option<u32>,
    pub service_action: Option<u16>,
}

fn allocation_length(cdb: &[u8]) -> Option<u32> {
    let opcode = *cdb.first()?;
    match ScsiOpcode::from_u8(opcode)? {
        ScsiOpcode::Inquiry => Some(BigEndian::read_u16(cdb.get(3..5)?) as u32),
        ScsiOpcode::RequestSense | ScsiOpcode::ModeSense6 => Some(*cdb.get(4)? as u32),
        ScsiOpcode::ModeSense10 | ScsiOpcode::LogSense | ScsiOpcode::PersistentReserveIn => {
            Some(BigEndian::read_u16(cdb.get(7..9)?) as u32)
        }
        ScsiOpcode::ReportLuns | ScsiOpcode::MaintenanceIn => {
            Some(BigEndian::read_u32(cdb.get(6..10)?))
        }
        _ => None,
    }
}

/// Interpret a CDB and record what later phases need in `task`
///
/// Only call with `record = true` on a frame's first visit.
///
/// `class` applies when recording. A revisit keeps the class stored with the
/// task, so commands sent before an INQUIRY answer keep their first name.
pub fn dissect_command(
    task: &mut ScsiTaskInfo,
    cdb: &[u8],
    class: DeviceClass,
    record: bool,
) -> DissectResult<ScsiCommand> {
    let class = match (record, task.device_class) {
        (false, Some(first)) => first,
        _ => class,
    };
    let opcode = FrameBytes::new(cdb).u8(0)?;
    let alloc_len = allocation_length(cdb);
    let transfer_length = class.transfer_length(cdb);

    let mut name = class.opcode_name(opcode);
    let mut service_action = None;
    let mut extra = None;
    if class == DeviceClass::Osd && opcode == ScsiOpcode::VariableLength as u8 {
        let fb = FrameBytes::new(cdb);
        let sa = fb.u16(8)?;
        let cdb_format = if fb.has(11, 1) { (fb.u8(11)? & 0x30) >> 4 } else { 0 };
        name = osd_service_action_name(sa);
        service_action = Some(sa);
        extra = Some(TaskExtra::Osd {
            service_action: sa,
            cdb_format,
        });
    }

    if record {
        task.opcode = opcode as u16;
        task.alloc_len = alloc_len.unwrap_or(0);
        task.extra = extra;
        task.device_class = Some(class);
    }

    log::trace!("SCSI {} (0x{:02x}) as {:?}", name, opcode, class);

    Ok(ScsiCommand {
        opcode,
        name,
        class,
        transfer_length,
        alloc_len,
        service_action,
    })
}

/// Peripheral device type carried by Data-In of an INQUIRY, if any
pub fn dissect_data_in(task: &ScsiTaskInfo, offset: u32, data: &[u8]) -> Option<u8> {
    if task.opcode() != Some(ScsiOpcode::Inquiry as u8) || offset != 0 {
        return None;
    }
    data.first().map(|b| b & 0x1F)
}

/// Status and optional sense data of a completed task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScsiResponse {
    pub status: u8,
    /// Opcode of the command this answers, when correlated
    pub opcode: Option<u8>,
    pub sense: Option<SenseData>,
}

pub fn dissect_response(
    task: Option<&ScsiTaskInfo>,
    status: u8,
    sense: &[u8],
) -> DissectResult<ScsiResponse> {
    let sense = if sense.is_empty() {
        None
    } else {
        Some(SenseData::from_bytes(sense)?)
    };
    if let Some(ref s) = sense {
        log::debug!("SCSI status {} with sense {}", status_name(status), s);
    }
    Ok(ScsiResponse {
        status,
        opcode: task.and_then(|t| t.opcode()),
        sense,
    })
}

// ============================================================================
// Unit Tests
// ============================================================================
