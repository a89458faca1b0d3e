//! Backing store readers and writers.
//!
//! Two backends exist: `raw` packages the payload into a CRC- and
//! optionally HMAC-protected record with redundant copies; `dtb` serialises
//! the whole schema as a flattened device tree into a single file. The
//! schema's `backend-type` property picks one.

use std::io;
use std::path::Path;

use snafu::{OptionExt, ResultExt, Snafu};

mod dtb;
mod raw;

pub use dtb::DtbBackend;
pub use raw::{RawBackend, HEADER_LEN, RAW_BACKEND_COPIES};

use crate::device_tree::{NodeId, PropertyError, Tree};
use crate::devpath::{self, DeviceProvider};
use crate::digest::{self, HmacAlgo, Keystore};
use crate::state::{State, Variable};
use crate::storage;

/// Errors raised by backend configuration, load and save.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// The state has no backend attached.
    #[snafu(display("state has no backend"))]
    NoBackend,
    /// The schema names a backend type this implementation does not have.
    #[snafu(display("invalid backend type: {name:?}"))]
    UnknownBackendType {
        /// The offending type string.
        name: String,
    },
    /// The schema's backend description is missing or ill-formed.
    #[snafu(display("backend description: {source}"))]
    BackendSchema {
        /// Underlying property failure.
        source: PropertyError,
    },
    /// The schema's `backend` phandle does not resolve to a node.
    #[snafu(display("cannot find backend node of {path}"))]
    NoBackendNode {
        /// The state node whose phandle dangled.
        path: String,
    },
    /// The backend node did not resolve to a device.
    #[snafu(display("cannot find backend path: {source}"))]
    Resolve {
        /// Underlying resolution failure.
        source: devpath::Error,
    },
    /// The backing medium could not be probed or erased.
    #[snafu(display("backend medium: {source}"))]
    Medium {
        /// Underlying storage failure.
        source: storage::Error,
    },
    /// HMAC configuration failed (unknown algo or keystore miss).
    #[snafu(display("backend digest: {source}"))]
    Digest {
        /// Underlying digest failure.
        source: digest::Error,
    },
    /// The requested region does not lie within the medium.
    #[snafu(display("region {offset}+{size} exceeds medium size {medium}"))]
    InvalidRegion {
        /// Requested offset.
        offset: u64,
        /// Requested length.
        size: u64,
        /// The medium's probed size.
        medium: u64,
    },
    /// The backing region cannot hold the required number of copies.
    #[snafu(display("not enough space for {copies} copies ({stride} bytes each)"))]
    NoSpace {
        /// Copies the backend must store.
        copies: usize,
        /// Bytes one copy occupies.
        stride: u64,
    },
    /// The payload exceeds what the record header can describe.
    #[snafu(display("payload of {size} bytes exceeds the record format limit"))]
    PayloadTooLarge {
        /// The computed payload size.
        size: u32,
    },
    /// An I/O operation on the backing store failed.
    #[snafu(display("{path}: {source}"))]
    Io {
        /// The device or file involved.
        path: String,
        /// Underlying failure.
        source: io::Error,
    },
    /// Every redundant copy failed its integrity checks.
    #[snafu(display("no valid state copy found on {path}"))]
    AllCopiesFailed {
        /// The device or file involved.
        path: String,
    },
    /// A DTB record did not decode as a flattened tree.
    #[snafu(display("cannot decode state blob: {source}"))]
    Decode {
        /// Underlying decode failure.
        source: crate::device_tree::fdt::FdtError,
    },
    /// A decoded DTB record did not match the schema.
    #[snafu(display("state blob rejected: {source}"))]
    Import {
        /// Underlying schema failure.
        source: crate::state::Error,
    },
}

pub(crate) type Result<T, E = Error> = core::result::Result<T, E>;

/// A configured backing store.
#[derive(Debug)]
pub enum Backend {
    /// Redundant raw record storage.
    Raw(RawBackend),
    /// Single flattened-device-tree file.
    Dtb(DtbBackend),
}

impl Backend {
    /// Configure the backend a state schema asks for.
    ///
    /// Reads `backend-type`, resolves the `backend` phandle to a device
    /// region, and (for raw backends with an `algo` property) binds the
    /// keystore secret to the named MAC. Without `algo` the keystore is
    /// never consulted.
    ///
    /// # Errors
    /// Any configuration failure from [`Error`].
    pub fn from_schema<P: DeviceProvider + ?Sized>(
        tree: &Tree,
        node: NodeId,
        state: &State,
        provider: &P,
        keystore: &dyn Keystore,
    ) -> Result<Backend> {
        let backend_type = tree
            .read_string(node, "backend-type")
            .context(BackendSchemaSnafu)?;
        let backend_node = tree.parse_phandle(node, "backend").context(NoBackendNodeSnafu {
            path: tree.path(node),
        })?;
        let of_path = tree.path(backend_node).to_string();
        let resolved = devpath::resolve(tree, backend_node, provider).context(ResolveSnafu)?;
        log::debug!(
            "backend of {} resolved to {} (offset 0x{:x}, size 0x{:x})",
            state.name(),
            resolved.path.display(),
            resolved.offset,
            resolved.size
        );

        match backend_type {
            "raw" => {
                let hmac = match tree.read_string(node, "algo") {
                    Ok(algo) => {
                        let key = keystore.get_secret(state.name()).context(DigestSnafu)?;
                        Some(HmacAlgo::new(algo, &key).context(DigestSnafu)?)
                    }
                    Err(PropertyError::NotFound { .. }) => None,
                    Err(source) => return Err(Error::BackendSchema { source }),
                };
                Ok(Backend::Raw(RawBackend::configure(
                    &resolved.path,
                    &of_path,
                    resolved.offset,
                    resolved.size,
                    state.size_data(),
                    hmac,
                )?))
            }
            "dtb" => Ok(Backend::Dtb(DtbBackend::configure(&resolved.path, &of_path))),
            other => UnknownBackendTypeSnafu { name: other }.fail(),
        }
    }

    /// The `backend-type` string this backend answers to.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Backend::Raw(_) => "raw",
            Backend::Dtb(_) => "dtb",
        }
    }

    /// The device or file the backend reads and writes.
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Backend::Raw(raw) => raw.path(),
            Backend::Dtb(dtb) => dtb.path(),
        }
    }

    /// The device tree path of the backing device's node.
    #[must_use]
    pub fn of_path(&self) -> &str {
        match self {
            Backend::Raw(raw) => raw.of_path(),
            Backend::Dtb(dtb) => dtb.of_path(),
        }
    }

    /// The configured MAC algorithm, if any.
    #[must_use]
    pub fn digest_algo(&self) -> Option<&str> {
        match self {
            Backend::Raw(raw) => raw.digest_algo(),
            Backend::Dtb(_) => None,
        }
    }

    /// Populate `vars` from the backing store.
    ///
    /// # Errors
    /// [`Error::AllCopiesFailed`] (raw) or decode/import failures (dtb).
    pub(crate) fn load(&mut self, magic: u32, vars: &mut [Variable], auth: bool) -> Result<()> {
        match self {
            Backend::Raw(raw) => raw.load(magic, vars, auth),
            Backend::Dtb(dtb) => dtb.load(magic, vars),
        }
    }
}
