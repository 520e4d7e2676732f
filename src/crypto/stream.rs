//! Chunked content encryption.
//!
//! Layout of one file's region inside a blob container:
//! ```text
//! [MAGIC 4B]["ALFB"]
//! [VERSION 1B][0x01]
//! [CHUNK_SIZE 4B][u32 LE, plaintext bytes per chunk]
//! [CHUNK 0][nonce 12B | ciphertext | tag 16B]
//! [CHUNK 1]...
//! ```
//! Each chunk is AES-256-GCM with AAD = file id || chunk index (u64 LE).
//! Small sources are written as a single chunk whose size equals the source
//! length; large ones use the configured chunk size.

use std::io::Read;

use uuid::Uuid;
use zeroize::Zeroizing;

use super::aead::{decrypt_chunk, encrypt_chunk, TAG_LEN};
use super::keys::{MasterKey, NONCE_LEN};
use crate::error::{VaultError, VaultResult};

const MAGIC: &[u8; 4] = b"ALFB";
const VERSION: u8 = 0x01;

/// MAGIC + VERSION + CHUNK_SIZE
pub const CONTENT_HEADER_LEN: usize = 4 + 1 + 4;

/// Per-chunk overhead (nonce + tag)
pub const CHUNK_OVERHEAD: usize = NONCE_LEN + TAG_LEN;

/// Plaintext chunk size used for a source of `plain_len` bytes
pub fn chunk_size_for(plain_len: u64, chunk_size: usize, streaming_threshold: u64) -> usize {
    if plain_len <= streaming_threshold {
        plain_len.max(1) as usize
    } else {
        chunk_size
    }
}

/// Exact encrypted length for a plaintext of `plain_len` bytes
pub fn encrypted_len(plain_len: u64, chunk_size: usize) -> u64 {
    let chunk = chunk_size.max(1) as u64;
    let chunks = plain_len.div_ceil(chunk).max(1);
    CONTENT_HEADER_LEN as u64 + chunks * CHUNK_OVERHEAD as u64 + plain_len
}

fn chunk_aad(file_id: &Uuid, index: u64) -> [u8; 24] {
    let mut aad = [0u8; 24];
    aad[..16].copy_from_slice(file_id.as_bytes());
    aad[16..].copy_from_slice(&index.to_le_bytes());
    aad
}

/// Fill `buf` from `reader` until it is full or the reader is exhausted
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Encrypt everything `reader` yields, handing each framed piece to `sink`
/// in order. Only one chunk of plaintext is held in memory at a time.
///
/// Returns the total number of bytes passed to `sink`.
pub fn encrypt_stream<R, F>(
    reader: &mut R,
    master: &MasterKey,
    file_id: &Uuid,
    chunk_size: usize,
    mut sink: F,
) -> VaultResult<u64>
where
    R: Read,
    F: FnMut(&[u8]) -> VaultResult<()>,
{
    let chunk_size = chunk_size.max(1);
    let chunk_size_u32 = u32::try_from(chunk_size)
        .map_err(|_| VaultError::EncryptionFailed("chunk size exceeds u32".into()))?;

    let mut header = [0u8; CONTENT_HEADER_LEN];
    header[..4].copy_from_slice(MAGIC);
    header[4] = VERSION;
    header[5..].copy_from_slice(&chunk_size_u32.to_le_bytes());
    sink(&header)?;
    let mut written = CONTENT_HEADER_LEN as u64;

    let mut buf = Zeroizing::new(vec![0u8; chunk_size]);
    let mut index = 0u64;
    loop {
        let n = read_full(reader, buf.as_mut_slice())?;
        if n == 0 && index > 0 {
            break;
        }

        let sealed = encrypt_chunk(master.as_secret(), &buf[..n], &chunk_aad(file_id, index))?;
        sink(&sealed)?;
        written += sealed.len() as u64;
        index += 1;

        if n < chunk_size {
            break;
        }
    }

    Ok(written)
}

/// Decrypt a full content region
pub fn decrypt_content(master: &MasterKey, file_id: &Uuid, data: &[u8]) -> VaultResult<Vec<u8>> {
    if data.len() < CONTENT_HEADER_LEN + CHUNK_OVERHEAD {
        return Err(VaultError::DecryptionFailed("Content too short".into()));
    }
    if &data[..4] != MAGIC {
        return Err(VaultError::DecryptionFailed("Invalid magic bytes".into()));
    }
    if data[4] != VERSION {
        return Err(VaultError::DecryptionFailed(format!(
            "Unsupported content version: {}",
            data[4]
        )));
    }

    let mut size_bytes = [0u8; 4];
    size_bytes.copy_from_slice(&data[5..CONTENT_HEADER_LEN]);
    let chunk_size = u32::from_le_bytes(size_bytes) as usize;
    if chunk_size == 0 {
        return Err(VaultError::DecryptionFailed("Zero chunk size".into()));
    }

    let mut plaintext = Vec::with_capacity(data.len());
    let mut rest = &data[CONTENT_HEADER_LEN..];
    let mut index = 0u64;
    while !rest.is_empty() {
        if rest.len() < CHUNK_OVERHEAD {
            return Err(VaultError::DecryptionFailed("Truncated chunk".into()));
        }
        let take = rest.len().min(chunk_size + CHUNK_OVERHEAD);
        let chunk = decrypt_chunk(master.as_secret(), &rest[..take], &chunk_aad(file_id, index))?;
        plaintext.extend_from_slice(&chunk);
        rest = &rest[take..];
        index += 1;
    }

    Ok(plaintext)
}
