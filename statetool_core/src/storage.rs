//! Backing medium probing and erase support.
//!
//! A backing store is a regular file, a block device, or an MTD character
//! device. The geometry decides how the raw backend spaces its redundant
//! copies: random-access media need no erase and stride at the record size,
//! MTD strides at eraseblock multiples and must erase before writing.

use std::fs::{self, File};
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::FileTypeExt;
use std::path::Path;

use snafu::{ResultExt, Snafu};

/// `MTD_NO_ERASE` flag: the medium can be written without erasing first.
const MTD_NO_ERASE: u32 = 0x1000;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
struct MtdInfoUser {
    mtd_type: u8,
    flags: u32,
    size: u32,
    erasesize: u32,
    writesize: u32,
    oobsize: u32,
    padding: u64,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
struct EraseInfoUser {
    start: u32,
    length: u32,
}

#[allow(missing_docs)]
mod ioctls {
    use super::{EraseInfoUser, MtdInfoUser};

    nix::ioctl_read!(blk_getsize64, 0x12, 114, u64);
    nix::ioctl_read!(mtd_memgetinfo, b'M', 1, MtdInfoUser);
    nix::ioctl_write_ptr!(mtd_memerase, b'M', 2, EraseInfoUser);
}
use ioctls::{blk_getsize64, mtd_memerase, mtd_memgetinfo};

/// Errors from medium probing and erasing.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// The path cannot be inspected.
    #[snafu(display("cannot probe {path}: {source}"))]
    Probe {
        /// The offending path.
        path: String,
        /// Underlying failure.
        source: io::Error,
    },
    /// The path exists but is no file, block device, or MTD device.
    #[snafu(display("{path} is not a usable backing medium"))]
    UnsupportedMedium {
        /// The offending path.
        path: String,
    },
    /// A device ioctl failed.
    #[snafu(display("ioctl on {path} failed: {source}"))]
    Ioctl {
        /// The offending path.
        path: String,
        /// Underlying failure.
        source: nix::Error,
    },
}

type Result<T, E = Error> = core::result::Result<T, E>;

/// What kind of medium backs a path.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum MediumKind {
    /// Regular file.
    File,
    /// Block device.
    Block,
    /// MTD character device.
    Mtd,
}

/// Probed geometry of a backing medium.
#[derive(Copy, Clone, Debug)]
pub struct Geometry {
    /// The medium kind.
    pub kind: MediumKind,
    /// Total size in bytes.
    pub size: u64,
    /// Minimal write unit.
    pub writesize: u32,
    /// Erase block size (1 where erasing is meaningless).
    pub erasesize: u32,
    /// Whether the medium can be overwritten without erasing.
    pub no_erase: bool,
}

impl Geometry {
    /// Whether writes must be preceded by an eraseblock erase.
    #[must_use]
    pub fn erase_required(&self) -> bool {
        self.kind == MediumKind::Mtd && !self.no_erase
    }
}

/// Probe the medium behind `path`.
///
/// # Errors
/// [`Error::Probe`] on stat/open failures, [`Error::UnsupportedMedium`] for
/// paths that are neither files nor known device types.
pub fn probe(path: &Path) -> Result<Geometry> {
    let display = || path.display().to_string();
    let meta = fs::metadata(path).with_context(|_| ProbeSnafu { path: display() })?;
    let file_type = meta.file_type();

    if file_type.is_file() {
        return Ok(Geometry {
            kind: MediumKind::File,
            size: meta.len(),
            writesize: 1,
            erasesize: 1,
            no_erase: true,
        });
    }

    if file_type.is_block_device() {
        let file = File::open(path).with_context(|_| ProbeSnafu { path: display() })?;
        let mut size = 0u64;
        unsafe { blk_getsize64(file.as_raw_fd(), &mut size) }
            .with_context(|_| IoctlSnafu { path: display() })?;
        return Ok(Geometry {
            kind: MediumKind::Block,
            size,
            writesize: 1,
            erasesize: 1,
            no_erase: true,
        });
    }

    if file_type.is_char_device() {
        let file = File::open(path).with_context(|_| ProbeSnafu { path: display() })?;
        let mut info = MtdInfoUser::default();
        unsafe { mtd_memgetinfo(file.as_raw_fd(), &mut info) }
            .with_context(|_| IoctlSnafu { path: display() })?;
        log::debug!(
            "{} is a mtd of size {}, erasesize {}, writesize {}",
            path.display(),
            info.size,
            info.erasesize,
            info.writesize
        );
        return Ok(Geometry {
            kind: MediumKind::Mtd,
            size: u64::from(info.size),
            writesize: info.writesize.max(1),
            erasesize: info.erasesize.max(1),
            no_erase: info.flags & MTD_NO_ERASE != 0,
        });
    }

    UnsupportedMediumSnafu { path: display() }.fail()
}

/// Erase `length` bytes at `offset` on an MTD device.
///
/// # Errors
/// [`Error::Ioctl`] when the device rejects the erase.
pub fn erase(file: &File, path: &Path, offset: u64, length: u64) -> Result<()> {
    let info = EraseInfoUser {
        start: offset as u32,
        length: length as u32,
    };
    unsafe { mtd_memerase(file.as_raw_fd(), &info) }.with_context(|_| IoctlSnafu {
        path: path.display().to_string(),
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn regular_files_probe_with_their_length() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        file.write_all(&[0u8; 4096]).unwrap();
        let geom = probe(file.path()).expect("probe");
        assert_eq!(geom.kind, MediumKind::File);
        assert_eq!(geom.size, 4096);
        assert!(!geom.erase_required());
    }

    #[test]
    fn missing_paths_fail_probe() {
        assert!(matches!(
            probe(Path::new("/nonexistent-statetool-medium")),
            Err(Error::Probe { .. })
        ));
    }
}
