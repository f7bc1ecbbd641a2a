//! On-disk blob file format.
//!
//! Committed blobs are stored with a 16-byte header followed by the payload:
//!
//! ```text
//! 0x00  4   "STRB" magic
//! 0x04  1   version (u8) = 1
//! 0x05  1   reserved (must be 0)
//! 0x06  1   algo: 1=blake3-256
//! 0x07  1   compression: 0=none, 1=zstd
//! 0x08  8   payload_len (u64 LE) - stored (possibly compressed) size
//! 0x10  ... payload
//! ```
//!
//! The digest always covers the uncompressed bytes.

use crate::digest::{Algorithm, Digest, Digester};
use crate::error::{Error, Result};
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Magic bytes at the start of every blob file.
pub const MAGIC: &[u8; 4] = b"STRB";

/// Current blob file format version.
pub const VERSION: u8 = 1;

/// Size of the blob file header in bytes.
pub const HEADER_SIZE: usize = 16;

/// Blobs at or above this size are zstd-compressed on disk.
pub const COMPRESSION_THRESHOLD: u64 = 4096;

/// Compression types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionType {
    /// No compression.
    None = 0,
    /// Zstandard compression.
    Zstd = 1,
}

impl CompressionType {
    /// Convert to byte representation.
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Parse from byte representation.
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(CompressionType::None),
            1 => Ok(CompressionType::Zstd),
            _ => Err(Error::compression_error(format!(
                "Invalid compression type: {}",
                value
            ))),
        }
    }

    /// Get the string name of this compression type.
    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionType::None => "none",
            CompressionType::Zstd => "zstd",
        }
    }

    /// Compression chosen for a blob of the given uncompressed size.
    pub fn for_size(size: u64) -> Self {
        if size >= COMPRESSION_THRESHOLD {
            CompressionType::Zstd
        } else {
            CompressionType::None
        }
    }
}

/// A 16-byte blob file header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobHeader {
    pub algorithm: Algorithm,
    pub compression: CompressionType,
    /// Length of the payload in bytes (compressed size if compressed).
    pub payload_len: u64,
}

impl BlobHeader {
    pub fn new(compression: CompressionType, payload_len: u64) -> Self {
        Self {
            algorithm: Algorithm::Blake3,
            compression,
            payload_len,
        }
    }

    /// Encode the header to a 16-byte array.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(MAGIC);
        buf[4] = VERSION;
        buf[6] = self.algorithm.id();
        buf[7] = self.compression.to_u8();
        buf[8..16].copy_from_slice(&self.payload_len.to_le_bytes());
        buf
    }

    /// Decode a header from a 16-byte array.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::invalid_digest(format!(
                "Header too short: {} bytes (expected {})",
                buf.len(),
                HEADER_SIZE
            )));
        }

        if &buf[0..4] != MAGIC {
            return Err(Error::invalid_digest(format!(
                "Invalid magic: expected {:?}, got {:?}",
                MAGIC,
                &buf[0..4]
            )));
        }

        if buf[4] != VERSION {
            return Err(Error::invalid_digest(format!(
                "Unsupported blob file version: {} (expected {})",
                buf[4], VERSION
            )));
        }

        if buf[5] != 0 {
            return Err(Error::invalid_digest(format!(
                "Reserved byte must be 0, got {}",
                buf[5]
            )));
        }

        let algorithm = Algorithm::from_id(buf[6])?;
        let compression = CompressionType::from_u8(buf[7])?;

        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&buf[8..16]);

        Ok(Self {
            algorithm,
            compression,
            payload_len: u64::from_le_bytes(len_bytes),
        })
    }
}

/// Encode the raw bytes at `source` into a blob file at `target`.
///
/// The file is written to a temporary file in the target directory and renamed
/// into place, so `target` is either absent or complete.
pub(crate) fn persist(source: &Path, target: &Path, size: u64) -> Result<()> {
    let parent = target
        .parent()
        .ok_or_else(|| Error::invalid_key(format!("blob path has no parent: {}", target.display())))?;
    fs::create_dir_all(parent)?;

    let compression = CompressionType::for_size(size);
    let mut temp_file = tempfile::NamedTempFile::new_in(parent)?;

    // Placeholder header; rewritten once the payload length is known
    temp_file.write_all(&BlobHeader::new(compression, 0).encode())?;

    let mut src = File::open(source)?;
    match compression {
        CompressionType::None => {
            io::copy(&mut src, temp_file.as_file_mut())?;
        }
        CompressionType::Zstd => {
            // Level 3 = fast compression
            zstd::stream::copy_encode(&mut src, temp_file.as_file_mut(), 3).map_err(|e| {
                Error::compression_error(format!("zstd compression failed: {}", e))
            })?;
        }
    }

    let file = temp_file.as_file_mut();
    let end = file.stream_position()?;
    let header = BlobHeader::new(compression, end - HEADER_SIZE as u64);
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&header.encode())?;
    file.sync_all()?;

    temp_file.persist(target)?;
    Ok(())
}

/// Read only the header of a blob file.
pub(crate) fn read_header(path: &Path) -> Result<BlobHeader> {
    let mut file = File::open(path)?;
    read_header_from(&mut file)
}

fn read_header_from(file: &mut File) -> Result<BlobHeader> {
    let mut header_buf = [0u8; HEADER_SIZE];
    file.read_exact(&mut header_buf)?;
    BlobHeader::decode(&header_buf)
}

/// Read a blob file and verify its bytes against `digest`.
pub(crate) fn read(path: &Path, digest: &Digest) -> Result<Vec<u8>> {
    let mut file = File::open(path)?;
    let header = read_header_from(&mut file)?;

    let mut stored = Vec::new();
    file.read_to_end(&mut stored)?;

    if stored.len() as u64 != header.payload_len {
        return Err(Error::corrupted_object(
            path,
            format!(
                "Payload length mismatch: expected {}, got {}",
                header.payload_len,
                stored.len()
            ),
        ));
    }

    let payload = match header.compression {
        CompressionType::None => stored,
        CompressionType::Zstd => zstd::decode_all(stored.as_slice())
            .map_err(|e| Error::compression_error(format!("zstd decompression failed: {}", e)))?,
    };

    // Verify the digest of the uncompressed data (corruption detection)
    let computed = Digest::of_bytes(&payload);
    if computed != *digest {
        return Err(Error::corrupted_object(
            path,
            format!("Digest mismatch: expected {}, got {}", digest, computed),
        ));
    }

    Ok(payload)
}

/// Stream a blob file's bytes into `writer`, verifying them against `digest`.
///
/// Bytes reach `writer` before verification completes; on a mismatch the
/// caller must discard what it received.
pub(crate) fn copy_verified<W: Write>(path: &Path, digest: &Digest, writer: W) -> Result<u64> {
    let mut file = File::open(path)?;
    let header = read_header_from(&mut file)?;

    let mut payload = (&mut file).take(header.payload_len);
    let mut out = HashingWriter {
        inner: writer,
        digester: Digester::new(),
    };
    match header.compression {
        CompressionType::None => {
            io::copy(&mut payload, &mut out)?;
        }
        CompressionType::Zstd => {
            zstd::stream::copy_decode(&mut payload, &mut out).map_err(|e| {
                Error::compression_error(format!("zstd decompression failed: {}", e))
            })?;
        }
    }

    let short = payload.limit();
    let trailing = file.read(&mut [0u8; 1])?;
    if short != 0 || trailing != 0 {
        return Err(Error::corrupted_object(
            path,
            format!(
                "Payload length mismatch: expected {} bytes",
                header.payload_len
            ),
        ));
    }

    out.inner.flush()?;
    let computed = out.digester.finish();
    if computed != *digest {
        return Err(Error::corrupted_object(
            path,
            format!("Digest mismatch: expected {}, got {}", digest, computed),
        ));
    }
    Ok(out.digester.len())
}

/// Forwards writes while hashing them.
struct HashingWriter<W> {
    inner: W,
    digester: Digester,
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.digester.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_source(dir: &TempDir, data: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join("source");
        fs::write(&path, data).unwrap();
        path
    }

    #[test]
    fn test_header_encode_decode() {
        let header = BlobHeader::new(CompressionType::Zstd, 0x123456789ABCDEF0);
        let encoded = header.encode();
        assert_eq!(&encoded[0..4], MAGIC);
        assert_eq!(BlobHeader::decode(&encoded).unwrap(), header);
    }

    #[test]
    fn test_header_decode_rejects_garbage() {
        let mut buf = BlobHeader::new(CompressionType::None, 1).encode();
        buf[0] = b'X';
        assert!(BlobHeader::decode(&buf).is_err());

        let mut buf = BlobHeader::new(CompressionType::None, 1).encode();
        buf[4] = 99;
        assert!(BlobHeader::decode(&buf).is_err());

        let mut buf = BlobHeader::new(CompressionType::None, 1).encode();
        buf[7] = 42;
        assert!(BlobHeader::decode(&buf).is_err());

        assert!(BlobHeader::decode(&[0u8; 10]).is_err());
    }

    #[test]
    fn test_small_blob_is_stored_uncompressed() {
        let dir = TempDir::new().unwrap();
        let data = b"small layer";
        let source = write_source(&dir, data);
        let target = dir.path().join("ab").join("blob");

        persist(&source, &target, data.len() as u64).unwrap();

        let raw = fs::read(&target).unwrap();
        let header = BlobHeader::decode(&raw).unwrap();
        assert_eq!(header.compression, CompressionType::None);
        assert_eq!(&raw[HEADER_SIZE..], data);
        assert_eq!(read(&target, &Digest::of_bytes(data)).unwrap(), data);
    }

    #[test]
    fn test_large_blob_is_compressed() {
        let dir = TempDir::new().unwrap();
        let data = vec![0x5Au8; 64 * 1024];
        let source = write_source(&dir, &data);
        let target = dir.path().join("blob");

        persist(&source, &target, data.len() as u64).unwrap();

        let on_disk = fs::metadata(&target).unwrap().len();
        assert!(on_disk < data.len() as u64);
        assert_eq!(read(&target, &Digest::of_bytes(&data)).unwrap(), data);
    }

    #[test]
    fn test_read_detects_corruption() {
        let dir = TempDir::new().unwrap();
        let data = b"immutable bytes";
        let source = write_source(&dir, data);
        let target = dir.path().join("blob");
        persist(&source, &target, data.len() as u64).unwrap();

        let mut raw = fs::read(&target).unwrap();
        raw[HEADER_SIZE] ^= 0xFF;
        fs::write(&target, raw).unwrap();

        let err = read(&target, &Digest::of_bytes(data)).unwrap_err();
        assert!(matches!(err, Error::CorruptedObject { .. }));
    }

    #[test]
    fn test_copy_verified_streams_compressed_blob() {
        let dir = TempDir::new().unwrap();
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let source = write_source(&dir, &data);
        let target = dir.path().join("blob");
        persist(&source, &target, data.len() as u64).unwrap();
        assert_eq!(read_header(&target).unwrap().compression, CompressionType::Zstd);

        let mut out = Vec::new();
        let copied = copy_verified(&target, &Digest::of_bytes(&data), &mut out).unwrap();
        assert_eq!(copied, data.len() as u64);
        assert_eq!(out, data);
    }

    #[test]
    fn test_copy_verified_detects_corruption() {
        let dir = TempDir::new().unwrap();
        let data = b"immutable bytes";
        let source = write_source(&dir, data);
        let target = dir.path().join("blob");
        persist(&source, &target, data.len() as u64).unwrap();

        let mut raw = fs::read(&target).unwrap();
        raw[HEADER_SIZE + 1] ^= 0xFF;
        fs::write(&target, &raw).unwrap();
        let err = copy_verified(&target, &Digest::of_bytes(data), io::sink()).unwrap_err();
        assert!(matches!(err, Error::CorruptedObject { .. }));

        // Trailing garbage after the declared payload
        raw[HEADER_SIZE + 1] ^= 0xFF;
        raw.push(0);
        fs::write(&target, &raw).unwrap();
        let err = copy_verified(&target, &Digest::of_bytes(data), io::sink()).unwrap_err();
        assert!(matches!(err, Error::CorruptedObject { .. }));
    }

    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            ..ProptestConfig::default()
        })]

        /// Stored blobs read back identically on both sides of the compression threshold
        #[test]
        fn prop_blob_file_preserves_bytes(data in prop::collection::vec(any::<u8>(), 0..10_000)) {
            let dir = TempDir::new().unwrap();
            let source = write_source(&dir, &data);
            let target = dir.path().join("blob");
            persist(&source, &target, data.len() as u64)?;
            prop_assert_eq!(read(&target, &Digest::of_bytes(&data))?, data);
        }
    }
}
