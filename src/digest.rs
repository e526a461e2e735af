//! CRC32C (Castagnoli) digests as carried by iSCSI
//!
//! iSCSI header and data digests are CRC32C values (RFC 3720 Section 12.1
//! and Appendix B). The wire carries the final CRC least significant byte
//! first, so a big-endian read of the 4 digest bytes yields the byte-swapped
//! CRC. [`crc32c`] works in that swapped domain; [`iscsi_digest`] returns the
//! value to compare against a big-endian read of the wire.

use std::fmt;

/// Initial value for every iSCSI digest computation
pub const CRC32C_PRELOAD: u32 = 0xFFFF_FFFF;

/// Size of a header or data digest on the wire
pub const DIGEST_SIZE: usize = 4;

/// Bit-reversed form of the Castagnoli polynomial 0x1EDC6F41
const CRC32C_POLY_REVERSED: u32 = 0x82F6_3B78;

static CRC32C_TABLE: [u32; 256] = build_table();

const fn build_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ CRC32C_POLY_REVERSED
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Table-driven CRC32C over `buf`
///
/// The seed is byte-swapped before the loop and the result byte-swapped
/// after it, matching the iSCSI wire-endianness convention.
pub fn crc32c(buf: &[u8], seed: u32) -> u32 {
    let mut crc = seed.swap_bytes();
    for &byte in buf {
        crc = (crc >> 8) ^ CRC32C_TABLE[((crc ^ byte as u32) & 0xFF) as usize];
    }
    crc.swap_bytes()
}

/// Digest value as a big-endian read of the wire digest bytes must show it
pub fn iscsi_digest(buf: &[u8]) -> u32 {
    !crc32c(buf, CRC32C_PRELOAD)
}

/// Conventional CRC32C checksum (e.g. 0xE3069283 for "123456789")
pub fn crc32c_checksum(buf: &[u8]) -> u32 {
    iscsi_digest(buf).swap_bytes()
}

/// Outcome of comparing a received digest with the computed one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestCheck {
    Good(u32),
    Bad { received: u32, computed: u32 },
}

impl DigestCheck {
    pub fn is_good(&self) -> bool {
        matches!(self, DigestCheck::Good(_))
    }

    /// Value that was read from the wire
    pub fn received(&self) -> u32 {
        match *self {
            DigestCheck::Good(v) => v,
            DigestCheck::Bad { received, .. } => received,
        }
    }
}

impl fmt::Display for DigestCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            DigestCheck::Good(v) => write!(f, "0x{:08x} (Good CRC32)", v),
            DigestCheck::Bad { received, computed } => write!(
                f,
                "0x{:08x} (Bad CRC32, should be 0x{:08x})",
                received, computed
            ),
        }
    }
}

/// Check `received` against the digest of `covered`
pub fn verify_digest(covered: &[u8], received: u32) -> DigestCheck {
    let computed = iscsi_digest(covered);
    if computed == received {
        DigestCheck::Good(received)
    } else {
        DigestCheck::Bad { received, computed }
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
