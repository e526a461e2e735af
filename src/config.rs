//! Operator preferences
//!
//! Defaults match what a capture analyst expects out of the box. Preferences
//! can also be loaded from a TOML document:
//!
//! ```toml
//! [fc]
//! reassemble = true
//! max_frame_size = 2048
//!
//! [iscsi]
//! protocol_version = "rfc3720"
//! target_port = 3260
//! enable_data_digest = true
//!
//! [scsi]
//! default_device_type = 1
//! ```

use crate::error::{DissectError, DissectResult};
use crate::scsi::peripheral_type;

/// Largest accepted `fc.max_frame_size`; keeps `SEQ_CNT * max_frame_size` within u32
pub const MAX_FRAME_SIZE_LIMIT: u32 = 65_536;

/// iSCSI protocol revision the capture is interpreted as
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum ProtocolVersion {
    Draft08,
    Draft09,
    Draft11,
    Draft12,
    Draft13,
    #[default]
    Rfc3720,
}

impl ProtocolVersion {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "draft08" | "draft-08" => Some(ProtocolVersion::Draft08),
            "draft09" | "draft-09" => Some(ProtocolVersion::Draft09),
            "draft11" | "draft-11" => Some(ProtocolVersion::Draft11),
            "draft12" | "draft-12" => Some(ProtocolVersion::Draft12),
            "draft13" | "draft-13" => Some(ProtocolVersion::Draft13),
            "rfc3720" | "rfc-3720" => Some(ProtocolVersion::Rfc3720),
            _ => None,
        }
    }

    /// Data-In PDUs may carry status (S bit) from draft 11 on
    pub fn has_data_in_status(&self) -> bool {
        *self > ProtocolVersion::Draft09
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FcPreferences {
    /// Reassemble multi-frame sequences
    pub reassemble: bool,
    /// Payload size of every frame of a sequence but the last
    pub max_frame_size: u32,
}

impl Default for FcPreferences {
    fn default() -> Self {
        FcPreferences {
            reassemble: true,
            max_frame_size: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IscsiPreferences {
    /// Ask the host for more bytes when a PDU spans TCP segments
    pub reassemble: bool,
    pub protocol_version: ProtocolVersion,
    /// Reject candidate PDUs with implausible lengths
    pub bogosity_filter: bool,
    /// Largest data segment accepted by the bogosity filter
    pub bogus_data_length_threshold: u32,
    /// Require the F bit on PDU types that always set it
    pub demand_good_f_bit: bool,
    pub target_port: u16,
    /// Only accept PDUs with one endpoint on `target_port`
    pub heuristic_ports: bool,
    pub enable_data_digest: bool,
    pub data_digest_is_crc32c: bool,
    /// Bytes skipped after the data segment when the digest is not CRC32C
    pub data_digest_size: u8,
}

impl Default for IscsiPreferences {
    fn default() -> Self {
        IscsiPreferences {
            reassemble: true,
            protocol_version: ProtocolVersion::default(),
            bogosity_filter: true,
            bogus_data_length_threshold: 256 * 1024,
            demand_good_f_bit: false,
            target_port: 3260,
            heuristic_ports: true,
            enable_data_digest: false,
            data_digest_is_crc32c: true,
            data_digest_size: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScsiPreferences {
    /// Peripheral type assumed for targets never seen answering INQUIRY
    pub default_device_type: u8,
    /// Peripheral type forced for every target, bypassing inference
    pub device_type_override: Option<u8>,
}

impl Default for ScsiPreferences {
    fn default() -> Self {
        ScsiPreferences {
            default_device_type: peripheral_type::DISK,
            device_type_override: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Preferences {
    pub fc: FcPreferences,
    pub iscsi: IscsiPreferences,
    pub scsi: ScsiPreferences,
}

fn get_bool(table: &toml::Value, section: &str, key: &str, target: &mut bool) -> DissectResult<()> {
    if let Some(v) = table.get(key) {
        *target = v.as_bool().ok_or_else(|| {
            DissectError::Config(format!("[{}] {} must be a boolean", section, key))
        })?;
    }
    Ok(())
}

fn get_int(table: &toml::Value, section: &str, key: &str, max: u64) -> DissectResult<Option<u64>> {
    match table.get(key) {
        None => Ok(None),
        Some(v) => {
            let n = v.as_integer().ok_or_else(|| {
                DissectError::Config(format!("[{}] {} must be an integer", section, key))
            })?;
            if n < 0 || n as u64 > max {
                return Err(DissectError::Config(format!(
                    "[{}] {} = {} is out of range 0..={}",
                    section, key, n, max
                )));
            }
            Ok(Some(n as u64))
        }
    }
}

impl Preferences {
    /// Parse preferences from TOML; missing keys keep their defaults
    pub fn from_toml_str(contents: &str) -> DissectResult<Self> {
        let config = contents
            .parse::<toml::Value>()
            .map_err(|e| DissectError::Config(format!("invalid TOML: {}", e)))?;
        let mut prefs = Preferences::default();

        if let Some(fc) = config.get("fc") {
            get_bool(fc, "fc", "reassemble", &mut prefs.fc.reassemble)?;
            if let Some(n) = get_int(fc, "fc", "max_frame_size", u32::MAX as u64)? {
                prefs.fc.max_frame_size = n as u32;
            }
        }

        if let Some(iscsi) = config.get("iscsi") {
            let p = &mut prefs.iscsi;
            get_bool(iscsi, "iscsi", "reassemble", &mut p.reassemble)?;
            get_bool(iscsi, "iscsi", "bogosity_filter", &mut p.bogosity_filter)?;
            get_bool(iscsi, "iscsi", "demand_good_f_bit", &mut p.demand_good_f_bit)?;
            get_bool(iscsi, "iscsi", "heuristic_ports", &mut p.heuristic_ports)?;
            get_bool(iscsi, "iscsi", "enable_data_digest", &mut p.enable_data_digest)?;
            get_bool(iscsi, "iscsi", "data_digest_is_crc32c", &mut p.data_digest_is_crc32c)?;
            if let Some(name) = iscsi.get("protocol_version") {
                let name = name.as_str().ok_or_else(|| {
                    DissectError::Config("[iscsi] protocol_version must be a string".to_string())
                })?;
                p.protocol_version = ProtocolVersion::from_name(name).ok_or_else(|| {
                    DissectError::Config(format!("[iscsi] unknown protocol_version '{}'", name))
                })?;
            }
            if let Some(n) = get_int(iscsi, "iscsi", "bogus_data_length_threshold", 0x00FF_FFFF)? {
                p.bogus_data_length_threshold = n as u32;
            }
            if let Some(n) = get_int(iscsi, "iscsi", "target_port", u16::MAX as u64)? {
                p.target_port = n as u16;
            }
            if let Some(n) = get_int(iscsi, "iscsi", "data_digest_size", u8::MAX as u64)? {
                p.data_digest_size = n as u8;
            }
        }

        if let Some(scsi) = config.get("scsi") {
            if let Some(n) = get_int(scsi, "scsi", "default_device_type", 0x1F)? {
                prefs.scsi.default_device_type = n as u8;
            }
            if let Some(n) = get_int(scsi, "scsi", "device_type_override", 0x1F)? {
                prefs.scsi.device_type_override = Some(n as u8);
            }
        }

        prefs.validate()?;
        Ok(prefs)
    }

    /// Reject combinations the dissectors cannot work with
    pub fn validate(&self) -> DissectResult<()> {
        if self.fc.max_frame_size == 0 {
            return Err(DissectError::Config("fc.max_frame_size must be non-zero".to_string()));
        }
        if self.fc.max_frame_size > MAX_FRAME_SIZE_LIMIT {
            return Err(DissectError::Config(format!(
                "fc.max_frame_size {} exceeds {}",
                self.fc.max_frame_size, MAX_FRAME_SIZE_LIMIT
            )));
        }
        if self.iscsi.bogus_data_length_threshold == 0 {
            return Err(DissectError::Config(
                "iscsi.bogus_data_length_threshold must be non-zero".to_string(),
            ));
        }
        if self.iscsi.data_digest_size > 4 {
            return Err(DissectError::Config(format!(
                "iscsi.data_digest_size {} exceeds 4 bytes",
                self.iscsi.data_digest_size
            )));
        }
        if self.scsi.default_device_type > 0x1F {
            return Err(DissectError::Config(format!(
                "scsi.default_device_type 0x{:02x} is not a peripheral device type",
                self.scsi.default_device_type
            )));
        }
        Ok(())
    }
}
