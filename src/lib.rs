//! Request/response correlation and reassembly for captured SAN traffic
//!
//! This library follows SCSI operations across the frames of a capture, for
//! Fibre Channel (FCP) and iSCSI. It keeps the per-capture state a protocol
//! analyzer needs to link frames together:
//!
//! - conversations between two endpoints
//! - FC exchanges keyed by OX_ID, with first/last frame and elapsed time
//! - iSCSI tasks keyed by Initiator Task Tag, linking command, data and response
//! - FC sequence reassembly with streaming SEQ_CNT normalization
//! - iSCSI header digest auto detection and CRC32C digest checks
//! - SCSI peripheral device types learned from INQUIRY data
//!
//! Every table is owned by an [`AnalysisSession`]. Frames are fed in capture
//! order with `first_visit` set; revisiting a frame later returns the same
//! cross references without changing any state.
//!
//! # Example
//!
//! ```
//! use san_dissect::{AnalysisSession, Endpoint, FrameInfo, IscsiDissection};
//! use san_dissect::iscsi::{opcode, flags, Bhs};
//! use std::net::Ipv4Addr;
//! use std::time::Duration;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut session = AnalysisSession::builder().target_port(3260).build()?;
//!
//! let initiator = Endpoint::new(Ipv4Addr::new(10, 0, 0, 1), 51000);
//! let target = Endpoint::new(Ipv4Addr::new(10, 0, 0, 2), 3260);
//!
//! let mut cmd = Bhs::new(opcode::SCSI_COMMAND, flags::FINAL, 7);
//! cmd.set_byte(32, 0x00); // TEST UNIT READY
//! let frame = FrameInfo::new(1, Duration::ZERO, initiator, target);
//! session.dissect_iscsi(&frame, &cmd.to_bytes())?;
//!
//! let rsp = Bhs::new(opcode::SCSI_RESPONSE, flags::FINAL, 7);
//! let frame = FrameInfo::new(2, Duration::from_millis(3), target, initiator);
//! if let IscsiDissection::Segment(seg) = session.dissect_iscsi(&frame, &rsp.to_bytes())? {
//!     for note in &seg.pdus[0].annotations {
//!         println!("{}", note); // "Request in frame 1", "Time from request: ..."
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod analysis;
pub mod annotation;
pub mod buffer;
pub mod config;
pub mod conversation;
pub mod digest;
pub mod error;
pub mod exchange;
pub mod fc;
pub mod fcp;
pub mod frame;
pub mod iscsi;
pub mod reassembly;
pub mod scsi;
pub mod session;
pub mod task;

pub use analysis::{AnalysisSession, AnalysisSessionBuilder};
pub use annotation::Annotation;
pub use config::{Preferences, ProtocolVersion};
pub use conversation::{Address, ConversationId, Endpoint, Transport};
pub use digest::DigestCheck;
pub use error::{DissectError, DissectResult};
pub use fc::{Delimiters, FcDissection, FcEncapsulation};
pub use frame::FrameInfo;
pub use iscsi::{IscsiDissection, IscsiSegment};
pub use reassembly::SequenceOutcome;

/// Version of this library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
