//! Keyed record authentication.
//!
//! A schema root may carry an `algo` property naming a keyed MAC in kernel
//! crypto notation (`hmac(sha256)` and friends). The key comes from a
//! keystore looked up by instance name; the MAC is computed over the raw
//! record's header and payload and stored behind them.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use hmac::{Hmac, Mac};
use sha2::{Sha256, Sha384, Sha512};
use snafu::{ResultExt, Snafu};

/// Errors from MAC configuration and verification.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// The schema names an algorithm this implementation does not provide.
    #[snafu(display("unsupported algo {name:?}"))]
    UnsupportedAlgo {
        /// The requested algorithm.
        name: String,
    },
    /// The keystore has no usable secret for the instance.
    #[snafu(display("no secret for {name}: {source}"))]
    Keystore {
        /// The instance name used for the lookup.
        name: String,
        /// Underlying failure.
        source: io::Error,
    },
    /// The key was rejected by the MAC implementation.
    #[snafu(display("invalid key material"))]
    InvalidKey,
    /// The stored MAC does not match the recomputed one.
    #[snafu(display("HMAC verification failed"))]
    Mismatch,
}

type Result<T, E = Error> = core::result::Result<T, E>;

/// Opaque secret lookup, keyed by state instance name.
pub trait Keystore {
    /// Fetch the key bytes for `name`.
    ///
    /// # Errors
    /// [`Error::Keystore`] when no secret exists or it cannot be read.
    fn get_secret(&self, name: &str) -> Result<Vec<u8>>;
}

/// A keystore reading raw key files from a directory, one file per state.
#[derive(Debug, Clone)]
pub struct DirKeystore {
    dir: PathBuf,
}

impl DirKeystore {
    /// Where keys live unless configured otherwise.
    pub const DEFAULT_DIR: &'static str = "/etc/statetool/keys";

    /// A keystore rooted at `dir`.
    #[must_use]
    pub fn new(dir: &Path) -> Self {
        DirKeystore { dir: dir.into() }
    }
}

impl Default for DirKeystore {
    fn default() -> Self {
        Self::new(Path::new(Self::DEFAULT_DIR))
    }
}

impl Keystore for DirKeystore {
    fn get_secret(&self, name: &str) -> Result<Vec<u8>> {
        fs::read(self.dir.join(name)).context(KeystoreSnafu { name })
    }
}

#[derive(Clone)]
enum Inner {
    Sha256(Hmac<Sha256>),
    Sha384(Hmac<Sha384>),
    Sha512(Hmac<Sha512>),
}

/// A configured MAC: algorithm name plus key, ready to produce streams.
#[derive(Clone)]
pub struct HmacAlgo {
    name: String,
    inner: Inner,
}

impl core::fmt::Debug for HmacAlgo {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HmacAlgo").field("name", &self.name).finish()
    }
}

impl HmacAlgo {
    /// Bind `algo` (kernel crypto notation) to `key`.
    ///
    /// # Errors
    /// [`Error::UnsupportedAlgo`] for unknown names.
    pub fn new(algo: &str, key: &[u8]) -> Result<Self> {
        let inner = match algo {
            "hmac(sha256)" => Inner::Sha256(Hmac::new_from_slice(key).map_err(|_| Error::InvalidKey)?),
            "hmac(sha384)" => Inner::Sha384(Hmac::new_from_slice(key).map_err(|_| Error::InvalidKey)?),
            "hmac(sha512)" => Inner::Sha512(Hmac::new_from_slice(key).map_err(|_| Error::InvalidKey)?),
            other => return UnsupportedAlgoSnafu { name: other }.fail(),
        };
        Ok(HmacAlgo {
            name: algo.into(),
            inner,
        })
    }

    /// The algorithm name as the schema spells it.
    #[must_use]
    pub fn algo(&self) -> &str {
        &self.name
    }

    /// Length in bytes of the MAC this algorithm appends.
    #[must_use]
    pub fn digest_len(&self) -> usize {
        match self.inner {
            Inner::Sha256(_) => 32,
            Inner::Sha384(_) => 48,
            Inner::Sha512(_) => 64,
        }
    }

    /// Start a fresh streaming computation.
    #[must_use]
    pub fn begin(&self) -> HmacStream {
        HmacStream {
            inner: self.inner.clone(),
        }
    }
}

/// An in-progress MAC computation.
pub struct HmacStream {
    inner: Inner,
}

impl HmacStream {
    /// Feed `data` into the MAC.
    pub fn update(&mut self, data: &[u8]) {
        match &mut self.inner {
            Inner::Sha256(mac) => mac.update(data),
            Inner::Sha384(mac) => mac.update(data),
            Inner::Sha512(mac) => mac.update(data),
        }
    }

    /// Finish and return the MAC bytes.
    #[must_use]
    pub fn finalize(self) -> Vec<u8> {
        match self.inner {
            Inner::Sha256(mac) => mac.finalize().into_bytes().to_vec(),
            Inner::Sha384(mac) => mac.finalize().into_bytes().to_vec(),
            Inner::Sha512(mac) => mac.finalize().into_bytes().to_vec(),
        }
    }

    /// Finish and compare against `tag` in constant time.
    ///
    /// # Errors
    /// [`Error::Mismatch`] when the tags differ.
    pub fn verify(self, tag: &[u8]) -> Result<()> {
        let ok = match self.inner {
            Inner::Sha256(mac) => mac.verify_slice(tag).is_ok(),
            Inner::Sha384(mac) => mac.verify_slice(tag).is_ok(),
            Inner::Sha512(mac) => mac.verify_slice(tag).is_ok(),
        };
        if ok {
            Ok(())
        } else {
            MismatchSnafu.fail()
        }
    }
}
