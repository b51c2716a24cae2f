//! Integrity: per-chunk additive checksum, verify on receive.

/// Sum of all bytes modulo 256.
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// Verify chunk data against the checksum carried in its DATA frame.
pub fn verify_chunk(data: &[u8], expected: u8) -> bool {
    checksum(data) == expected
}
