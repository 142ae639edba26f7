//! Binary volume shards ("MRV1").
//!
//! Layout (all little-endian):
//!
//! | bytes  | field                      |
//! |--------|----------------------------|
//! | 0..4   | magic `MRV1`               |
//! | 4..8   | format version (u32)       |
//! | 8..12  | channels (u32)             |
//! | 12..24 | shape x, y, z (3 x u32)    |
//! | 24..32 | image payload offset (u64) |
//! | 32..40 | label payload offset (u64) |
//! | 40..64 | reserved, zero             |
//!
//! The image payload is `channels * x * y * z` f32 values in C, X, Y, Z order,
//! followed by `x * y * z` u16 labels.

use crate::types::{voxel_count, DatasetError, DatasetResult, Shape3};
use crate::volume::Volume;
use memmap2::MmapOptions;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

pub const SHARD_MAGIC: &[u8; 4] = b"MRV1";
pub const SHARD_VERSION: u32 = 1;
pub const HEADER_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardHeader {
    pub version: u32,
    pub channels: usize,
    pub shape: Shape3,
    pub image_offset: u64,
    pub label_offset: u64,
}

impl ShardHeader {
    pub fn for_volume(channels: usize, shape: Shape3) -> Self {
        let image_bytes = (channels * voxel_count(shape) * 4) as u64;
        Self {
            version: SHARD_VERSION,
            channels,
            shape,
            image_offset: HEADER_LEN as u64,
            label_offset: HEADER_LEN as u64 + image_bytes,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut header = [0u8; HEADER_LEN];
        header[0..4].copy_from_slice(SHARD_MAGIC);
        header[4..8].copy_from_slice(&self.version.to_le_bytes());
        header[8..12].copy_from_slice(&(self.channels as u32).to_le_bytes());
        for (axis, dim) in self.shape.iter().enumerate() {
            let start = 12 + axis * 4;
            header[start..start + 4].copy_from_slice(&(*dim as u32).to_le_bytes());
        }
        header[24..32].copy_from_slice(&self.image_offset.to_le_bytes());
        header[32..40].copy_from_slice(&self.label_offset.to_le_bytes());
        header
    }

    /// Byte lengths of the image and label payloads, `None` on overflow.
    pub fn payload_bytes(&self) -> Option<(u64, u64)> {
        let voxels = self
            .shape
            .iter()
            .try_fold(1u64, |acc, &d| acc.checked_mul(d as u64))?;
        let image = voxels.checked_mul(self.channels as u64)?.checked_mul(4)?;
        let labels = voxels.checked_mul(2)?;
        Some((image, labels))
    }

    pub fn decode(path: &Path, data: &[u8]) -> DatasetResult<Self> {
        let bad = |msg: String| DatasetError::BadShard {
            path: path.to_path_buf(),
            msg,
        };
        if data.len() < HEADER_LEN {
            return Err(bad(format!("{} bytes is smaller than the header", data.len())));
        }
        if &data[0..4] != SHARD_MAGIC {
            return Err(bad("bad magic".into()));
        }
        let version = read_u32_le(&data[4..8]);
        if version != SHARD_VERSION {
            return Err(bad(format!(
                "unsupported shard version {version} (expected {SHARD_VERSION})"
            )));
        }
        let header = Self {
            version,
            channels: read_u32_le(&data[8..12]) as usize,
            shape: [
                read_u32_le(&data[12..16]) as usize,
                read_u32_le(&data[16..20]) as usize,
                read_u32_le(&data[20..24]) as usize,
            ],
            image_offset: read_u64_le(&data[24..32]),
            label_offset: read_u64_le(&data[32..40]),
        };
        let (image_bytes, label_bytes) = header
            .payload_bytes()
            .ok_or_else(|| bad("header sizes overflow".into()))?;
        let (image_end, label_end) = match (
            header.image_offset.checked_add(image_bytes),
            header.label_offset.checked_add(label_bytes),
        ) {
            (Some(image_end), Some(label_end)) => (image_end, label_end),
            _ => return Err(bad("header sizes overflow".into())),
        };
        if header.image_offset < HEADER_LEN as u64 || header.label_offset < image_end {
            return Err(bad("payload offsets overlap".into()));
        }
        if label_end > data.len() as u64 {
            return Err(bad(format!(
                "truncated: need {label_end} bytes, file has {}",
                data.len()
            )));
        }
        Ok(header)
    }
}

/// Write `volume` to `path`, returning the hex SHA256 of the file contents.
pub fn write_volume_shard(path: &Path, volume: &Volume) -> DatasetResult<String> {
    let io_err = |source| DatasetError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    let header = ShardHeader::for_volume(volume.channels, volume.shape);
    let mut hasher = Sha256::new();
    let file = File::create(path).map_err(io_err)?;
    let mut writer = BufWriter::new(file);

    let encoded = header.encode();
    hasher.update(encoded);
    writer.write_all(&encoded).map_err(io_err)?;

    let mut buf = Vec::with_capacity(volume.image.len() * 4);
    for v in &volume.image {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    hasher.update(&buf);
    writer.write_all(&buf).map_err(io_err)?;

    buf.clear();
    for l in &volume.labels {
        buf.extend_from_slice(&l.to_le_bytes());
    }
    hasher.update(&buf);
    writer.write_all(&buf).map_err(io_err)?;
    writer.flush().map_err(io_err)?;

    Ok(format!("{:x}", hasher.finalize()))
}

/// Memory-map a shard and copy it into an owned [`Volume`].
pub fn read_volume_shard(path: &Path, subject: &str) -> DatasetResult<Volume> {
    let file = File::open(path).map_err(|e| DatasetError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    // SAFETY: the shard is opened read-only and copied out before the map is dropped.
    let mmap = unsafe { MmapOptions::new().map(&file) }.map_err(|e| DatasetError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    let header = ShardHeader::decode(path, &mmap)?;
    let (image_len, label_len) =
        header
            .payload_bytes()
            .ok_or_else(|| DatasetError::BadShard {
                path: path.to_path_buf(),
                msg: "header sizes overflow".into(),
            })?;

    let image_start = header.image_offset as usize;
    let image_bytes = &mmap[image_start..image_start + image_len as usize];
    let image = image_bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();

    let label_start = header.label_offset as usize;
    let label_bytes = &mmap[label_start..label_start + label_len as usize];
    let labels = label_bytes
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();

    Volume::new(subject, header.shape, header.channels, image, labels)
}

/// Hex SHA256 of a file on disk.
pub fn sha256_file(path: &Path) -> DatasetResult<String> {
    let data = fs::read(path).map_err(|e| DatasetError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(format!("{:x}", Sha256::digest(&data)))
}

fn read_u32_le(data: &[u8]) -> u32 {
    let mut arr = [0u8; 4];
    arr.copy_from_slice(data);
    u32::from_le_bytes(arr)
}

fn read_u64_le(data: &[u8]) -> u64 {
    let mut arr = [0u8; 8];
    arr.copy_from_slice(data);
    u64::from_le_bytes(arr)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_volume() -> Volume {
        let shape = [3, 2, 4];
        let n = voxel_count(shape);
        let image = (0..2 * n).map(|v| v as f32 * 0.5 - 3.0).collect();
        let labels = (0..n).map(|v| (v * 7 % 5) as u16).collect();
        Volume::new("s1", shape, 2, image, labels).unwrap()
    }

    #[test]
    fn shard_preserves_volume() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("s1.mrv");
        let vol = sample_volume();
        let checksum = write_volume_shard(&path, &vol).unwrap();
        assert_eq!(checksum, sha256_file(&path).unwrap());

        let back = read_volume_shard(&path, "s1").unwrap();
        assert_eq!(back.shape, vol.shape);
        assert_eq!(back.channels, 2);
        assert_eq!(back.image, vol.image);
        assert_eq!(back.labels, vol.labels);
    }

    #[test]
    fn truncated_shard_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("s1.mrv");
        write_volume_shard(&path, &sample_volume()).unwrap();
        let data = fs::read(&path).unwrap();
        fs::write(&path, &data[..data.len() - 3]).unwrap();
        let err = read_volume_shard(&path, "s1").unwrap_err();
        assert!(matches!(err, DatasetError::BadShard { .. }), "{err}");
    }

    fn raw_header(channels: u32, shape: [u32; 3], image_offset: u64, label_offset: u64) -> Vec<u8> {
        let mut data = vec![0u8; 2 * HEADER_LEN];
        data[0..4].copy_from_slice(SHARD_MAGIC);
        data[4..8].copy_from_slice(&SHARD_VERSION.to_le_bytes());
        data[8..12].copy_from_slice(&channels.to_le_bytes());
        for (axis, dim) in shape.iter().enumerate() {
            data[12 + axis * 4..16 + axis * 4].copy_from_slice(&dim.to_le_bytes());
        }
        data[24..32].copy_from_slice(&image_offset.to_le_bytes());
        data[32..40].copy_from_slice(&label_offset.to_le_bytes());
        data
    }

    #[test]
    fn garbled_header_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("garbled.mrv");
        let cases = [
            raw_header(1, [u32::MAX; 3], 64, 64),
            raw_header(u32::MAX, [u32::MAX, u32::MAX, 1], 64, 64),
            raw_header(1, [2, 2, 2], u64::MAX - 8, u64::MAX - 4),
            raw_header(1, [2, 2, 2], 64, u64::MAX),
        ];
        for data in cases {
            fs::write(&path, &data).unwrap();
            let err = read_volume_shard(&path, "g").unwrap_err();
            assert!(matches!(err, DatasetError::BadShard { .. }), "{err}");
        }
    }

    #[test]
    fn bad_magic_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("junk.mrv");
        fs::write(&path, vec![7u8; 128]).unwrap();
        let err = read_volume_shard(&path, "junk").unwrap_err();
        assert!(err.to_string().contains("bad magic"));
    }
}
