//! Annotations produced for the display layer
//!
//! Field-by-field rendering is left to the host. What this crate produces is
//! the set of cross references and integrity notes that need state from other
//! frames.

use crate::digest::DigestCheck;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Annotation {
    RequestIn(u32),
    ResponseIn(u32),
    DataInIn(u32),
    DataOutIn(u32),
    /// Time from the command to this frame
    TimeFromRequest(Duration),
    ExchangeFirstFrame(u32),
    ExchangeLastFrame(u32),
    /// Time from the first to the last frame of an FC exchange
    ExchangeTime(Duration),
    /// This fragment's sequence was completed in another frame
    ReassembledIn(u32),
    /// This frame completed a sequence built from these frames
    ReassembledFrom(Vec<u32>),
    HeaderDigest(DigestCheck),
    DataDigest(DigestCheck),
    BogusFragment,
    /// Payload that could not be interpreted
    Undissected(Vec<u8>),
}

impl Annotation {
    /// Integrity problems the display layer should flag
    pub fn is_warning(&self) -> bool {
        match self {
            Annotation::HeaderDigest(check) | Annotation::DataDigest(check) => !check.is_good(),
            Annotation::BogusFragment => true,
            _ => false,
        }
    }
}

fn fmt_seconds(d: &Duration) -> String {
    format!("{}.{:09} seconds", d.as_secs(), d.subsec_nanos())
}

impl fmt::Display for Annotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Annotation::RequestIn(n) => write!(f, "Request in frame {}", n),
            Annotation::ResponseIn(n) => write!(f, "Response in frame {}", n),
            Annotation::DataInIn(n) => write!(f, "Data In in frame {}", n),
            Annotation::DataOutIn(n) => write!(f, "Data Out in frame {}", n),
            Annotation::TimeFromRequest(d) => write!(f, "Time from request: {}", fmt_seconds(d)),
            Annotation::ExchangeFirstFrame(n) => write!(f, "Exchange first in frame {}", n),
            Annotation::ExchangeLastFrame(n) => write!(f, "Exchange last in frame {}", n),
            Annotation::ExchangeTime(d) => write!(f, "Exchange time: {}", fmt_seconds(d)),
            Annotation::ReassembledIn(n) => write!(f, "Reassembled in frame {}", n),
            Annotation::ReassembledFrom(frames) => {
                let list: Vec<String> = frames.iter().map(|n| format!("#{}", n)).collect();
                write!(f, "Reassembled from {} frames: {}", frames.len(), list.join(", "))
            }
            Annotation::HeaderDigest(check) => write!(f, "HeaderDigest: {}", check),
            Annotation::DataDigest(check) => write!(f, "DataDigest: {}", check),
            Annotation::BogusFragment => write!(f, "Bogus Fragment"),
            Annotation::Undissected(bytes) => {
                write!(f, "Data ({} bytes): {}", bytes.len(), hex::encode(bytes))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cross_reference_text() {
        assert_eq!(Annotation::RequestIn(7).to_string(), "Request in frame 7");
        assert_eq!(Annotation::DataInIn(2).to_string(), "Data In in frame 2");
        assert_eq!(
            Annotation::TimeFromRequest(Duration::from_millis(1500)).to_string(),
            "Time from request: 1.500000000 seconds"
        );
        assert_eq!(
            Annotation::ReassembledFrom(vec![3, 4]).to_string(),
            "Reassembled from 2 frames: #3, #4"
        );
    }

    #[test]
    fn test_undissected_hex() {
        let a = Annotation::Undissected(vec![0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(a.to_string(), "Data (4 bytes): deadbeef");
    }

    #[test]
    fn test_warnings() {
        assert!(Annotation::BogusFragment.is_warning());
        assert!(!Annotation::HeaderDigest(DigestCheck::Good(1)).is_warning());
        assert!(Annotation::DataDigest(DigestCheck::Bad { received: 1, computed: 2 }).is_warning());
        assert!(!Annotation::RequestIn(1).is_warning());
    }
}
