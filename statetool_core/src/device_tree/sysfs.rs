//! Device tree sources exported by the kernel.
//!
//! Prefers the flat blob at `/sys/firmware/fdt`; falls back to the expanded
//! directory form where every file is a property and every subdirectory a
//! child node.

use std::fs;
use std::io;
use std::path::Path;

use byteorder::{BigEndian, ByteOrder};
use snafu::{ResultExt, Snafu};

use super::{fdt, NodeId, Tree};

/// The flattened blob exported by the kernel.
pub const FDT_BLOB: &str = "/sys/firmware/fdt";
/// The expanded tree under sysfs.
pub const SYSFS_BASE: &str = "/sys/firmware/devicetree/base";
/// The legacy procfs view of the same tree.
pub const PROC_BASE: &str = "/proc/device-tree";

/// Errors raised while loading a kernel-exported tree.
#[derive(Debug, Snafu)]
pub enum SysfsError {
    /// Reading a file or directory failed.
    #[snafu(display("cannot read {path}: {source}"))]
    Read {
        /// The offending path.
        path: String,
        /// Underlying I/O failure.
        source: io::Error,
    },
    /// The blob did not decode.
    #[snafu(display("cannot decode {path}: {source}"))]
    Decode {
        /// The offending path.
        path: String,
        /// Underlying decode failure.
        source: fdt::FdtError,
    },
    /// None of the known kernel sources exist.
    #[snafu(display("kernel exports no device tree"))]
    NoSource,
}

type Result<T, E = SysfsError> = core::result::Result<T, E>;

/// Load the running system's device tree.
///
/// # Errors
/// [`SysfsError::NoSource`] when the kernel exports no tree, otherwise the
/// read or decode failure of the source that was found.
pub fn load_system_tree() -> Result<Tree> {
    if Path::new(FDT_BLOB).exists() {
        return load_from(Path::new(FDT_BLOB));
    }
    for base in [SYSFS_BASE, PROC_BASE] {
        if Path::new(base).is_dir() {
            return load_from(Path::new(base));
        }
    }
    NoSourceSnafu.fail()
}

/// Load a tree from `path`: a flattened blob if it is a file, the expanded
/// directory form if it is a directory.
///
/// # Errors
/// Read or decode failures for the given source.
pub fn load_from(path: &Path) -> Result<Tree> {
    if path.is_dir() {
        let mut tree = Tree::new();
        let root = tree.root();
        scan_dir(&mut tree, root, path)?;
        tree.alias_scan();
        return Ok(tree);
    }
    let blob = fs::read(path).context(ReadSnafu {
        path: path.display().to_string(),
    })?;
    fdt::unflatten(&blob).context(DecodeSnafu {
        path: path.display().to_string(),
    })
}

fn scan_dir(tree: &mut Tree, node: NodeId, path: &Path) -> Result<()> {
    let read_ctx = || ReadSnafu {
        path: path.display().to_string(),
    };
    let mut entries: Vec<_> = fs::read_dir(path)
        .context(read_ctx())?
        .collect::<io::Result<_>>()
        .context(read_ctx())?;
    entries.sort_by_key(std::fs::DirEntry::file_name);

    for entry in entries {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.starts_with('.') {
            continue;
        }
        let entry_path = entry.path();
        let kind = entry.file_type().context(read_ctx())?;
        if kind.is_dir() {
            let child = tree.add_node(node, name);
            scan_dir(tree, child, &entry_path)?;
        } else {
            let value = fs::read(&entry_path).context(ReadSnafu {
                path: entry_path.display().to_string(),
            })?;
            if name == "phandle" && value.len() == 4 {
                tree.set_phandle(node, BigEndian::read_u32(&value));
            }
            tree.set_property(node, name, value);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scans_directories_into_nodes_and_files_into_properties() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = dir.path().join("state");
        fs::create_dir(&state).unwrap();
        fs::write(state.join("magic"), 0xdead_beefu32.to_be_bytes()).unwrap();
        fs::write(state.join("phandle"), 5u32.to_be_bytes()).unwrap();
        let var = state.join("counter");
        fs::create_dir(&var).unwrap();
        fs::write(var.join("type"), b"uint32\0").unwrap();

        let tree = load_from(dir.path()).expect("scan");
        let state = tree.find_by_path("/state").expect("state node");
        assert_eq!(tree.read_u32(state, "magic").unwrap(), 0xdead_beef);
        assert_eq!(tree.phandle(state), Some(5));
        let counter = tree.find_by_path("/state/counter").expect("counter node");
        assert_eq!(tree.read_string(counter, "type").unwrap(), "uint32");
    }

    #[test]
    fn loads_blob_files() {
        let mut tree = Tree::new();
        let chosen = tree.add_node(tree.root(), "chosen");
        tree.write_string(chosen, "bootargs", "quiet");
        let blob = fdt::flatten(&tree);

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("fdt");
        fs::write(&path, blob).unwrap();

        let loaded = load_from(&path).expect("load blob");
        let chosen = loaded.find_by_path("/chosen").expect("chosen node");
        assert_eq!(loaded.read_string(chosen, "bootargs").unwrap(), "quiet");
    }

    #[test]
    fn scan_of_missing_directory_fails() {
        assert!(load_from(Path::new("/nonexistent-statetool-test")).is_err());
    }
}
