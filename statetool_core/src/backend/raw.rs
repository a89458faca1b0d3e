//! Redundant raw record storage.
//!
//! One copy on the medium looks like:
//!
//! ```text
//! header:  u32 magic | u16 reserved | u16 data_len | u32 data_crc | u32 header_crc
//! payload: size_data bytes, each variable at its declared start offset
//! hmac:    digest-length bytes, present iff an algorithm is configured
//! ```
//!
//! All header fields are little-endian. Two copies are kept, strided so
//! that on erase-required media each lands in its own eraseblock. Loading
//! takes the first copy that passes every check; saving writes the copy
//! that load succeeded from *last*, so an interrupted save always leaves at
//! least one readable copy behind.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};
use snafu::{ensure, ResultExt, Snafu};

#[cfg(test)]
use super::Error;
use super::{
    AllCopiesFailedSnafu, InvalidRegionSnafu, IoSnafu, MediumSnafu, NoSpaceSnafu,
    PayloadTooLargeSnafu, Result,
};
use crate::digest::HmacAlgo;
use crate::state::Variable;
use crate::storage;

/// Number of redundant copies a raw backend maintains.
pub const RAW_BACKEND_COPIES: usize = 2;

/// On-medium record header length in bytes.
pub const HEADER_LEN: usize = 16;

/// Why one particular copy was rejected. Recovered locally by trying the
/// next copy; only surfaced when every copy fails.
#[derive(Debug, Snafu)]
enum CopyError {
    /// The record could not be read in full.
    #[snafu(display("cannot read record: {source}"))]
    Read {
        /// Underlying failure (including short reads).
        source: io::Error,
    },
    /// The stored header checksum disagrees with the recomputed one.
    #[snafu(display("invalid header crc, calculated 0x{calculated:08x}, found 0x{found:08x}"))]
    HeaderCrc {
        /// CRC computed over the header bytes.
        calculated: u32,
        /// CRC stored in the header.
        found: u32,
    },
    /// The record belongs to a different schema.
    #[snafu(display("invalid magic 0x{found:08x}, should be 0x{expected:08x}"))]
    Magic {
        /// Magic stored in the record.
        found: u32,
        /// Magic the schema declares.
        expected: u32,
    },
    /// The header claims more payload than a copy slot can hold.
    #[snafu(display("invalid data_len {len} in header, max is {max}"))]
    OversizedData {
        /// Claimed payload length.
        len: u16,
        /// Largest payload a slot can hold.
        max: u64,
    },
    /// The stored payload checksum disagrees with the recomputed one.
    #[snafu(display("invalid crc, calculated 0x{calculated:08x}, found 0x{found:08x}"))]
    DataCrc {
        /// CRC computed over the payload.
        calculated: u32,
        /// CRC stored in the header.
        found: u32,
    },
    /// The keyed MAC does not match.
    #[snafu(display("HMAC verification failed"))]
    Hmac,
}

struct Header {
    magic: u32,
    data_len: u16,
    data_crc: u32,
    header_crc: u32,
}

impl Header {
    fn parse(buf: &[u8]) -> Header {
        Header {
            magic: LittleEndian::read_u32(&buf[0..]),
            // u16 reserved at offset 4 stays zero
            data_len: LittleEndian::read_u16(&buf[6..]),
            data_crc: LittleEndian::read_u32(&buf[8..]),
            header_crc: LittleEndian::read_u32(&buf[12..]),
        }
    }

    fn write(&self, buf: &mut [u8]) {
        LittleEndian::write_u32(&mut buf[0..], self.magic);
        LittleEndian::write_u16(&mut buf[4..], 0);
        LittleEndian::write_u16(&mut buf[6..], self.data_len);
        LittleEndian::write_u32(&mut buf[8..], self.data_crc);
        LittleEndian::write_u32(&mut buf[12..], self.header_crc);
    }
}

/// The raw backend: a device region holding [`RAW_BACKEND_COPIES`] strided
/// record copies.
#[derive(Debug)]
pub struct RawBackend {
    path: PathBuf,
    of_path: String,
    offset: u64,
    size: u64,
    size_data: u32,
    size_full: u32,
    stride: u32,
    need_erase: bool,
    num_copy_read: usize,
    hmac: Option<HmacAlgo>,
}

fn align_up(value: u32, to: u32) -> u32 {
    value.div_ceil(to) * to
}

impl RawBackend {
    /// Probe the medium and compute the copy layout.
    ///
    /// `size` 0 means "use the whole medium". On erase-required media the
    /// record is padded to the write unit and copies stride at eraseblock
    /// multiples; elsewhere the stride equals the record size.
    ///
    /// # Errors
    /// Probe failures, bad regions, and [`Error::NoSpace`] when the region
    /// cannot hold all copies.
    pub fn configure(
        path: &Path,
        of_path: &str,
        offset: u64,
        size: u64,
        size_data: u32,
        hmac: Option<HmacAlgo>,
    ) -> Result<RawBackend> {
        let geometry = storage::probe(path).context(MediumSnafu)?;
        let size = if size == 0 {
            geometry.size
        } else {
            ensure!(
                offset + size <= geometry.size,
                InvalidRegionSnafu {
                    offset,
                    size,
                    medium: geometry.size
                }
            );
            size
        };
        ensure!(
            size_data <= u32::from(u16::MAX),
            PayloadTooLargeSnafu { size: size_data }
        );

        let digest_len = hmac.as_ref().map_or(0, HmacAlgo::digest_len) as u32;
        let mut size_full = HEADER_LEN as u32 + size_data + digest_len;
        let need_erase = geometry.erase_required();
        let stride = if need_erase {
            size_full = align_up(size_full, geometry.writesize);
            let stride = align_up(size_full, geometry.erasesize);
            log::debug!("{} is a mtd, adjust stepsize to {stride}", path.display());
            stride
        } else {
            size_full
        };

        ensure!(
            size / u64::from(stride) >= RAW_BACKEND_COPIES as u64,
            NoSpaceSnafu {
                copies: RAW_BACKEND_COPIES,
                stride: u64::from(stride)
            }
        );

        Ok(RawBackend {
            path: path.into(),
            of_path: of_path.into(),
            offset,
            size,
            size_data,
            size_full,
            stride,
            need_erase,
            num_copy_read: 0,
            hmac,
        })
    }

    /// The backing device path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The backing device's node path in the device tree.
    #[must_use]
    pub fn of_path(&self) -> &str {
        &self.of_path
    }

    /// Length of the storage region set aside for the copies.
    #[must_use]
    pub fn region_len(&self) -> u64 {
        self.size
    }

    /// The configured MAC algorithm name, if any.
    #[must_use]
    pub fn digest_algo(&self) -> Option<&str> {
        self.hmac.as_ref().map(HmacAlgo::algo)
    }

    /// Bytes one record occupies (header + payload + MAC, write-aligned).
    #[must_use]
    pub fn size_full(&self) -> u32 {
        self.size_full
    }

    /// Byte distance between consecutive copies.
    #[must_use]
    pub fn stride(&self) -> u32 {
        self.stride
    }

    /// The copy index the last successful load came from.
    #[must_use]
    pub fn num_copy_read(&self) -> usize {
        self.num_copy_read
    }

    /// Load the first valid copy into `vars`.
    ///
    /// With `auth` false the MAC comparison alone is skipped.
    ///
    /// # Errors
    /// [`Error::AllCopiesFailed`] after logging each copy's failure.
    pub(crate) fn load(&mut self, magic: u32, vars: &mut [Variable], auth: bool) -> Result<()> {
        let file = File::open(&self.path).with_context(|_| IoSnafu {
            path: self.path.display().to_string(),
        })?;
        for copy in 0..RAW_BACKEND_COPIES {
            match self.load_one(&file, magic, vars, auth, copy) {
                Ok(()) => {
                    log::debug!("copy {copy} successfully loaded");
                    self.num_copy_read = copy;
                    return Ok(());
                }
                Err(err) => log::debug!("copy {copy}: {err}"),
            }
        }
        AllCopiesFailedSnafu {
            path: self.path.display().to_string(),
        }
        .fail()
    }

    fn load_one(
        &self,
        file: &File,
        magic: u32,
        vars: &mut [Variable],
        auth: bool,
        copy: usize,
    ) -> Result<(), CopyError> {
        let offset = self.offset + copy as u64 * u64::from(self.stride);

        let mut header_buf = [0u8; HEADER_LEN];
        file.read_exact_at(&mut header_buf, offset).context(ReadSnafu)?;
        let header = Header::parse(&header_buf);

        let calculated = crc32fast::hash(&header_buf[..HEADER_LEN - 4]);
        ensure!(
            calculated == header.header_crc,
            HeaderCrcSnafu {
                calculated,
                found: header.header_crc
            }
        );

        if magic != 0 {
            ensure!(
                header.magic == magic,
                MagicSnafu {
                    found: header.magic,
                    expected: magic
                }
            );
        }

        let digest_len = self.hmac.as_ref().map_or(0, HmacAlgo::digest_len);
        let max_len = u64::from(self.stride) - HEADER_LEN as u64 - digest_len as u64;
        ensure!(
            u64::from(header.data_len) <= max_len,
            OversizedDataSnafu {
                len: header.data_len,
                max: max_len
            }
        );

        let data_len = usize::from(header.data_len);
        let mut body = vec![0u8; data_len + digest_len];
        file.read_exact_at(&mut body, offset + HEADER_LEN as u64)
            .context(ReadSnafu)?;
        let (payload, tag) = body.split_at(data_len);

        let calculated = crc32fast::hash(payload);
        ensure!(
            calculated == header.data_crc,
            DataCrcSnafu {
                calculated,
                found: header.data_crc
            }
        );

        if let (Some(hmac), true) = (&self.hmac, auth) {
            let mut mac = hmac.begin();
            mac.update(&header_buf);
            mac.update(payload);
            mac.verify(tag).map_err(|_| CopyError::Hmac)?;
        }

        for var in vars.iter_mut() {
            let start = var.start as usize;
            let end = start + var.size as usize;
            // variables are start-sorted, nothing later can fit either
            if end > data_len {
                break;
            }
            var.load_raw(&payload[start..end]);
        }
        Ok(())
    }

    /// Serialise `vars` and write every copy, the previously read one last.
    ///
    /// # Errors
    /// Erase or write failures on the medium.
    pub(crate) fn save(&self, magic: u32, vars: &[Variable]) -> Result<()> {
        let mut buf = vec![0u8; self.size_full as usize];
        let data_end = HEADER_LEN + self.size_data as usize;

        for var in vars {
            let start = HEADER_LEN + var.start as usize;
            var.store_raw(&mut buf[start..start + var.size as usize]);
        }

        let header = Header {
            magic,
            data_len: self.size_data as u16,
            data_crc: crc32fast::hash(&buf[HEADER_LEN..data_end]),
            header_crc: 0,
        };
        header.write(&mut buf[..HEADER_LEN]);
        let header_crc = crc32fast::hash(&buf[..HEADER_LEN - 4]);
        LittleEndian::write_u32(&mut buf[HEADER_LEN - 4..HEADER_LEN], header_crc);

        if let Some(hmac) = &self.hmac {
            let mut mac = hmac.begin();
            mac.update(&buf[..data_end]);
            let tag = mac.finalize();
            buf[data_end..data_end + tag.len()].copy_from_slice(&tag);
        }

        let file = OpenOptions::new()
            .write(true)
            .open(&self.path)
            .with_context(|_| IoSnafu {
                path: self.path.display().to_string(),
            })?;

        // the copy we read from is overwritten last, so a crash mid-save
        // leaves its pre-save contents readable
        for copy in 0..RAW_BACKEND_COPIES {
            if copy == self.num_copy_read {
                continue;
            }
            self.write_one(&file, copy, &buf)?;
        }
        self.write_one(&file, self.num_copy_read, &buf)?;
        Ok(())
    }

    fn write_one(&self, file: &File, copy: usize, buf: &[u8]) -> Result<()> {
        let offset = self.offset + copy as u64 * u64::from(self.stride);
        log::debug!("write copy {copy}: 0x{:08x} 0x{:08x}", offset, buf.len());
        let io_ctx = || IoSnafu {
            path: self.path.display().to_string(),
        };
        if self.need_erase {
            storage::erase(file, &self.path, offset, u64::from(self.stride))
                .context(MediumSnafu)?;
        }
        file.write_all_at(buf, offset).with_context(|_| io_ctx())?;
        // keep the copy ordering observable after a crash
        file.sync_data().with_context(|_| io_ctx())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::VariableKind;
    use std::io::Write;

    fn u32_var(name: &str, start: u32, value: u32) -> Variable {
        Variable {
            name: name.into(),
            start,
            size: 4,
            kind: VariableKind::Uint32 { value, default: 0 },
        }
    }

    fn region(len: usize) -> tempfile::NamedTempFile {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        file.write_all(&vec![0xffu8; len]).expect("fill region");
        file
    }

    fn backend(file: &tempfile::NamedTempFile, size_data: u32, hmac: Option<HmacAlgo>) -> RawBackend {
        RawBackend::configure(file.path(), "/flash@0/state", 0, 0, size_data, hmac)
            .expect("configure")
    }

    const MAGIC: u32 = 0xdead_beef;

    #[test]
    fn save_then_load_is_identity() {
        let file = region(64 * 1024);
        let mut raw = backend(&file, 8, None);
        let vars = vec![u32_var("a", 0, 0x11223344), u32_var("b", 4, 7)];
        raw.save(MAGIC, &vars).expect("save");

        let mut fresh = vec![u32_var("a", 0, 0), u32_var("b", 4, 0)];
        raw.load(MAGIC, &mut fresh, true).expect("load");
        assert_eq!(fresh, vars);
        assert_eq!(raw.num_copy_read(), 0);
    }

    #[test]
    fn record_layout_is_little_endian_with_valid_crcs() {
        let file = region(64 * 1024);
        let raw = backend(&file, 4, None);
        raw.save(MAGIC, &[u32_var("a", 0, 0xcafe_f00d)]).expect("save");

        let bytes = std::fs::read(file.path()).expect("read region");
        // magic, little-endian
        assert_eq!(&bytes[0..4], &[0xef, 0xbe, 0xad, 0xde]);
        // data_len
        assert_eq!(LittleEndian::read_u16(&bytes[6..]), 4);
        // payload bytes 0..3 hold the little-endian value
        assert_eq!(&bytes[16..20], &[0x0d, 0xf0, 0xfe, 0xca]);
        // stored CRCs match recomputation over exactly the covered bytes
        assert_eq!(
            LittleEndian::read_u32(&bytes[8..]),
            crc32fast::hash(&bytes[16..20])
        );
        assert_eq!(
            LittleEndian::read_u32(&bytes[12..]),
            crc32fast::hash(&bytes[..12])
        );
        // both copies are byte-identical
        let stride = raw.stride() as usize;
        let full = raw.size_full() as usize;
        assert_eq!(bytes[..full], bytes[stride..stride + full]);
    }

    #[test]
    fn corrupt_first_copy_falls_back_to_second() {
        let file = region(64 * 1024);
        let mut raw = backend(&file, 4, None);
        raw.save(MAGIC, &[u32_var("a", 0, 42)]).expect("save");

        // trash copy 0's header
        let mut bytes = std::fs::read(file.path()).unwrap();
        bytes[0] ^= 0xff;
        std::fs::write(file.path(), &bytes).unwrap();

        let mut vars = vec![u32_var("a", 0, 0)];
        raw.load(MAGIC, &mut vars, true).expect("load from copy 1");
        assert_eq!(raw.num_copy_read(), 1);
        assert!(matches!(vars[0].kind, VariableKind::Uint32 { value: 42, .. }));
    }

    #[test]
    fn corrupting_both_copies_fails_until_saved_again() {
        let file = region(64 * 1024);
        let mut raw = backend(&file, 4, None);
        raw.save(MAGIC, &[u32_var("a", 0, 42)]).expect("save");

        let stride = raw.stride() as usize;
        let mut bytes = std::fs::read(file.path()).unwrap();
        bytes[8] ^= 0xff; // copy 0 data crc
        bytes[stride + 8] ^= 0xff; // copy 1 data crc
        std::fs::write(file.path(), &bytes).unwrap();

        let mut vars = vec![u32_var("a", 0, 0)];
        assert!(matches!(
            raw.load(MAGIC, &mut vars, true),
            Err(Error::AllCopiesFailed { .. })
        ));

        raw.save(MAGIC, &[u32_var("a", 0, 43)]).expect("rewrite");
        raw.load(MAGIC, &mut vars, true).expect("load rewritten");
        assert!(matches!(vars[0].kind, VariableKind::Uint32 { value: 43, .. }));
    }

    #[test]
    fn foreign_magic_is_rejected() {
        let file = region(64 * 1024);
        let mut raw = backend(&file, 4, None);
        raw.save(0x0bad_cafe, &[u32_var("a", 0, 1)]).expect("save");
        let mut vars = vec![u32_var("a", 0, 0)];
        assert!(raw.load(MAGIC, &mut vars, true).is_err());
    }

    #[test]
    fn interrupted_save_leaves_previous_copy_readable() {
        let file = region(64 * 1024);
        let mut raw = backend(&file, 4, None);
        raw.save(MAGIC, &[u32_var("a", 0, 1)]).expect("initial save");
        let mut vars = vec![u32_var("a", 0, 0)];
        raw.load(MAGIC, &mut vars, true).expect("load");
        assert_eq!(raw.num_copy_read(), 0);

        // a full save would write copy 1 first, then copy 0. Emulate the
        // crash after the first write: copy 1 holds the new record, copy 0
        // still the old one.
        let other = backend(&file, 4, None);
        let snapshot = std::fs::read(file.path()).unwrap();
        other.save(MAGIC, &[u32_var("a", 0, 2)]).expect("save");
        let mut bytes = std::fs::read(file.path()).unwrap();
        let full = raw.size_full() as usize;
        bytes[..full].copy_from_slice(&snapshot[..full]);
        std::fs::write(file.path(), &bytes).unwrap();

        // at least one copy (the old read copy) must still load
        let mut reloaded = vec![u32_var("a", 0, 0)];
        raw.load(MAGIC, &mut reloaded, true).expect("reload");
        assert!(matches!(
            reloaded[0].kind,
            VariableKind::Uint32 { value: 1, .. }
        ));
    }

    #[test]
    fn hmac_protects_each_copy_independently() {
        let algo = HmacAlgo::new("hmac(sha256)", b"test-key").expect("algo");
        let file = region(64 * 1024);
        let mut raw = backend(&file, 4, Some(algo.clone()));
        assert_eq!(raw.size_full(), 16 + 4 + 32);
        raw.save(MAGIC, &[u32_var("a", 0, 9)]).expect("save");

        // flip one payload byte in copy 0: its MAC (and CRC) break, copy 1
        // still loads
        let mut bytes = std::fs::read(file.path()).unwrap();
        bytes[16] ^= 0x01;
        std::fs::write(file.path(), &bytes).unwrap();
        let mut vars = vec![u32_var("a", 0, 0)];
        raw.load(MAGIC, &mut vars, true).expect("copy 1 loads");
        assert_eq!(raw.num_copy_read(), 1);
    }

    #[test]
    fn skipping_authentication_ignores_only_the_mac() {
        let algo = HmacAlgo::new("hmac(sha256)", b"test-key").expect("algo");
        let file = region(64 * 1024);
        let mut raw = backend(&file, 4, Some(algo));
        raw.save(MAGIC, &[u32_var("a", 0, 9)]).expect("save");

        // trash the MAC bytes of both copies, leaving header and payload
        // (and their CRCs) intact
        let stride = raw.stride() as usize;
        let mut bytes = std::fs::read(file.path()).unwrap();
        for base in [0, stride] {
            for b in &mut bytes[base + 20..base + 52] {
                *b ^= 0xaa;
            }
        }
        std::fs::write(file.path(), &bytes).unwrap();

        let mut vars = vec![u32_var("a", 0, 0)];
        assert!(raw.load(MAGIC, &mut vars, true).is_err());
        raw.load(MAGIC, &mut vars, false).expect("-f load");
        assert!(matches!(vars[0].kind, VariableKind::Uint32 { value: 9, .. }));
    }

    #[test]
    fn any_single_bit_corruption_is_noticed() {
        use rand::Rng;

        let file = region(64 * 1024);
        let mut raw = backend(&file, 8, None);
        raw.save(
            MAGIC,
            &[u32_var("a", 0, 0x0102_0304), u32_var("b", 4, 0x0506_0708)],
        )
        .expect("save");

        let full = raw.size_full() as usize;
        let stride = raw.stride() as usize;
        let pristine = std::fs::read(file.path()).unwrap();
        let mut rng = rand::thread_rng();
        for _ in 0..32 {
            let pos = rng.gen_range(0..full);
            let bit = 1u8 << rng.gen_range(0..8);
            let mut bytes = pristine.clone();
            // flip the same bit in both copies
            bytes[pos] ^= bit;
            bytes[stride + pos] ^= bit;
            std::fs::write(file.path(), &bytes).unwrap();

            let mut vars = vec![u32_var("a", 0, 0), u32_var("b", 4, 0)];
            assert!(
                raw.load(MAGIC, &mut vars, true).is_err(),
                "corruption of bit {bit:#x} at byte {pos} went unnoticed"
            );
        }
    }

    #[test]
    fn region_too_small_for_two_copies_is_rejected() {
        let file = region(24);
        assert!(matches!(
            RawBackend::configure(file.path(), "/x", 0, 0, 8, None),
            Err(Error::NoSpace { .. })
        ));
    }

    #[test]
    fn variables_beyond_data_len_keep_their_defaults() {
        let file = region(64 * 1024);
        let raw = backend(&file, 4, None);
        raw.save(MAGIC, &[u32_var("a", 0, 5)]).expect("save");

        // a later schema revision grew a second variable past data_len
        let mut grown = backend(&file, 8, None);
        let mut vars = vec![u32_var("a", 0, 0), u32_var("b", 4, 1234)];
        grown.load(MAGIC, &mut vars, true).expect("load");
        assert!(matches!(vars[0].kind, VariableKind::Uint32 { value: 5, .. }));
        assert!(matches!(
            vars[1].kind,
            VariableKind::Uint32 { value: 1234, .. }
        ));
    }
}
