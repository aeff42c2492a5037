#![forbid(unsafe_code)]

/// CRC32 (IEEE) over several chunks, as if they were one contiguous buffer.
///
/// Log records, checkpoint images and bulk files all frame their bodies
/// with this checksum.
pub fn crc32(chunks: &[&[u8]]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    for chunk in chunks {
        hasher.update(chunk);
    }
    hasher.finalize()
}
