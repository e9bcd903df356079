// Checksum helpers.
//
// Pages carry a CRC32C computed over the full page image with the checksum
// field zeroed. Log-structured files (WAL, undo) frame each record with a
// CRC32 of the record body.

/// CRC32C (Castagnoli) over a full page image.
pub fn page_checksum(data: &[u8]) -> u32 {
    crc32c::crc32c(data)
}

/// CRC32 over a framed log record body.
pub fn record_crc(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// CRC32 over several body fragments without copying them together.
pub fn record_crc_parts(parts: &[&[u8]]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize()
}
