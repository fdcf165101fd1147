//! Staging-disk accounting and path layout.
//!
//! Staging is a shared finite resource. Stages reserve an estimate
//! before writing and the reservation is returned when the guard drops,
//! whether the work succeeded or not. Writes are segregated by package
//! UUID so workers never contend on a path.

use crate::error::{CourierError, Result};
use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

/// Copied tarballs are assumed to need this much headroom over the
/// declared package size (extraction overhead).
pub const COPY_RESERVE_FACTOR: f64 = 2.1;
/// Locally-assembled packages reserve twice their expected size.
pub const PACKAGE_RESERVE_FACTOR: f64 = 2.0;

#[derive(Debug)]
pub struct StagingArea {
    root: PathBuf,
    capacity: u64,
    reserved: Mutex<u64>,
}

impl StagingArea {
    pub fn new(root: &Path, capacity: u64) -> Result<Self> {
        fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
            capacity,
            reserved: Mutex::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where a package's tarball lives while in flight.
    pub fn tar_path(&self, uuid: Uuid) -> PathBuf {
        self.root.join(format!("{}.tar", uuid))
    }

    pub fn available(&self) -> u64 {
        self.capacity.saturating_sub(*self.reserved.lock())
    }

    /// Takes `bytes` out of the budget. The returned guard gives the
    /// bytes back when dropped.
    pub fn reserve(self: &Arc<Self>, bytes: u64) -> Result<Reservation> {
        let mut reserved = self.reserved.lock();
        let available = self.capacity.saturating_sub(*reserved);
        if bytes > available {
            return Err(CourierError::DiskExhausted {
                needed: bytes,
                available,
            });
        }
        *reserved += bytes;
        Ok(Reservation {
            area: Arc::clone(self),
            bytes,
        })
    }

    fn release(&self, bytes: u64) {
        let mut reserved = self.reserved.lock();
        *reserved = reserved.saturating_sub(bytes);
    }
}

/// An outstanding staging reservation.
#[derive(Debug)]
pub struct Reservation {
    area: Arc<StagingArea>,
    bytes: u64,
}

impl Reservation {
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.area.release(self.bytes);
    }
}

/// Estimated staging need for copying a package of `size` bytes.
pub fn copy_estimate(size: u64) -> u64 {
    (size as f64 * COPY_RESERVE_FACTOR).ceil() as u64
}

/// Estimated staging need for assembling a package of `size` bytes.
pub fn package_estimate(size: u64) -> u64 {
    (size as f64 * PACKAGE_RESERVE_FACTOR).ceil() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let area = Arc::new(StagingArea::new(dir.path(), 1000).unwrap());
        assert_eq!(area.available(), 1000);

        let first = area.reserve(600).unwrap();
        assert_eq!(area.available(), 400);
        let err = area.reserve(500).unwrap_err();
        assert!(matches!(
            err,
            CourierError::DiskExhausted {
                needed: 500,
                available: 400
            }
        ));

        drop(first);
        assert_eq!(area.available(), 1000);
        let _second = area.reserve(500).unwrap();
        assert_eq!(area.available(), 500);
    }

    #[test]
    fn test_estimates_round_up() {
        assert_eq!(copy_estimate(100), 210);
        assert_eq!(copy_estimate(1), 3);
        assert_eq!(package_estimate(100), 200);
    }

    #[test]
    fn test_tar_path_layout() {
        let dir = tempfile::tempdir().unwrap();
        let area = Arc::new(StagingArea::new(dir.path(), 10).unwrap());
        let uuid = Uuid::new_v4();
        assert_eq!(
            area.tar_path(uuid),
            dir.path().join(format!("{}.tar", uuid))
        );
    }
}
