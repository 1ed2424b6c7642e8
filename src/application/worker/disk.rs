//! Free-space probe for the worker's scratch volume.

use std::io;
use std::path::{Path, PathBuf};

pub const DEFAULT_DISK_MIN_FREE_BYTES: u64 = 2 * 1024 * 1024 * 1024;

pub trait DiskProbe: Send + Sync {
    fn available_bytes(&self, path: &Path) -> io::Result<u64>;
}

/// Asks the filesystem holding `path` (or its closest existing ancestor).
#[derive(Debug, Default, Clone, Copy)]
pub struct FsDiskProbe;

impl DiskProbe for FsDiskProbe {
    fn available_bytes(&self, path: &Path) -> io::Result<u64> {
        fs4::available_space(existing_ancestor(path))
    }
}

/// Reports a constant amount of free space.
#[derive(Debug, Clone, Copy)]
pub struct FixedDiskProbe(pub u64);

impl DiskProbe for FixedDiskProbe {
    fn available_bytes(&self, _path: &Path) -> io::Result<u64> {
        Ok(self.0)
    }
}

fn existing_ancestor(path: &Path) -> PathBuf {
    path.ancestors()
        .find(|candidate| candidate.exists())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskCheck {
    Ok { free_bytes: u64 },
    Low { free_bytes: u64, floor_bytes: u64 },
}

pub fn check_disk(probe: &dyn DiskProbe, path: &Path, floor_bytes: u64) -> io::Result<DiskCheck> {
    let free_bytes = probe.available_bytes(path)?;
    if free_bytes < floor_bytes {
        Ok(DiskCheck::Low {
            free_bytes,
            floor_bytes,
        })
    } else {
        Ok(DiskCheck::Ok { free_bytes })
    }
}
