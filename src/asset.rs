use std::fmt;
use std::fs::OpenOptions;
use std::path::Path;

use bytes::Bytes;
use memmap2::{Mmap, MmapOptions};
use sha2::{Digest, Sha256};

use crate::error::UpdateError;

/// Backing storage of a firmware image.
enum AssetSource {
    Mapped(Mmap),
    Memory(Bytes),
    Empty,
}

impl AssetSource {
    fn as_slice(&self) -> &[u8] {
        match self {
            AssetSource::Mapped(mmap) => &mmap[..],
            AssetSource::Memory(bytes) => &bytes[..],
            AssetSource::Empty => &[],
        }
    }
}

/// Immutable firmware package selected by the operator.
///
/// The bytes are addressable by `[offset, offset + len)` and never change for
/// the lifetime of the asset.
pub struct FirmwareAsset {
    name: String,
    size: u64,
    source: AssetSource,
    sha256: String,
}

impl FirmwareAsset {
    /// Memory-map the file at `path`. The asset name is the file name, which
    /// is also what the device stores the upload under.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, UpdateError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(UpdateError::FileNotFound(path.to_path_buf()));
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| UpdateError::ConfigError(format!("{} has no file name", path.display())))?;

        let file = OpenOptions::new().read(true).open(path)?;
        let size = file.metadata()?.len();
        check_size(size)?;

        // Zero-length files cannot be mapped on every platform.
        let source = if size == 0 {
            AssetSource::Empty
        } else {
            // The mapping is read-only and the asset never hands out mutable access.
            let mmap = unsafe { MmapOptions::new().map(&file)? };
            AssetSource::Mapped(mmap)
        };

        Ok(Self::with_source(name, size, source))
    }

    /// Build an asset from bytes already in memory.
    pub fn from_bytes(name: impl Into<String>, data: impl Into<Bytes>) -> Result<Self, UpdateError> {
        let data = data.into();
        let size = data.len() as u64;
        check_size(size)?;
        Ok(Self::with_source(name.into(), size, AssetSource::Memory(data)))
    }

    fn with_source(name: String, size: u64, source: AssetSource) -> Self {
        let sha256 = hex::encode(Sha256::digest(source.as_slice()));
        Self { name, size, source, sha256 }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Hex SHA-256 of the whole image.
    pub fn sha256(&self) -> &str {
        &self.sha256
    }

    /// Bytes left after `offset`, zero at or past the end.
    pub fn remaining(&self, offset: u64) -> u64 {
        self.size.saturating_sub(offset)
    }

    /// Borrow `[offset, offset + len)` clamped to the end of the image.
    /// Returns `None` when `offset` is at or past the end.
    pub fn slice(&self, offset: u64, len: u64) -> Option<&[u8]> {
        if offset >= self.size {
            return None;
        }
        let len = len.min(self.size - offset);
        let start = usize::try_from(offset).ok()?;
        let end = usize::try_from(offset + len).ok()?;
        self.source.as_slice().get(start..end)
    }
}

impl fmt::Debug for FirmwareAsset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FirmwareAsset")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("sha256", &self.sha256)
            .finish()
    }
}

fn check_size(size: u64) -> Result<(), UpdateError> {
    if size > u64::from(u32::MAX) {
        return Err(UpdateError::AssetTooLarge(size));
    }
    Ok(())
}
