//! CRC32C (Castagnoli) helpers and the base64 encodings the storage
//! service uses for `crc32c` and `md5Hash` object metadata.

use base64::{Engine as _, engine::general_purpose::STANDARD};

/// CRC32C of a complete buffer.
pub fn crc32c(data: &[u8]) -> u32 {
    crc32c::crc32c(data)
}

/// Incremental CRC32C for content read in chunks.
#[derive(Debug, Default, Clone, Copy)]
pub struct Crc32cHasher {
    state: u32,
}

impl Crc32cHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.state = crc32c::crc32c_append(self.state, chunk);
    }

    pub fn finalize(self) -> u32 {
        self.state
    }
}

/// Decode the service's `crc32c` field: base64 of the big-endian value.
pub fn decode_crc32c(encoded: &str) -> Option<u32> {
    let raw = STANDARD.decode(encoded).ok()?;
    let bytes: [u8; 4] = raw.as_slice().try_into().ok()?;
    Some(u32::from_be_bytes(bytes))
}

pub fn encode_crc32c(value: u32) -> String {
    STANDARD.encode(value.to_be_bytes())
}

/// Base64 MD5 digest, as reported in `md5Hash`.
pub fn md5_base64(data: &[u8]) -> String {
    encode_md5(md5::compute(data))
}

pub fn encode_md5(digest: md5::Digest) -> String {
    STANDARD.encode(digest.0)
}
