//! Flattened-device-tree file backend.
//!
//! The whole schema, values included, is flattened into one blob and
//! written to a single file. There is no redundancy, checksum, or MAC;
//! correctness rests on the blob's own structure checks during decode.

use std::fs::{self, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use snafu::ResultExt;

use super::{DecodeSnafu, ImportSnafu, IoSnafu, MediumSnafu, Result};
use crate::device_tree::{fdt, Tree};
use crate::state::{self, Variable};
use crate::storage;

/// The DTB backend: one flattened blob in one file.
#[derive(Debug)]
pub struct DtbBackend {
    path: PathBuf,
    of_path: String,
    need_erase: bool,
}

impl DtbBackend {
    /// Bind the backend to `path`.
    ///
    /// Media that cannot be probed (or need no erase) are written directly.
    #[must_use]
    pub fn configure(path: &Path, of_path: &str) -> DtbBackend {
        let need_erase = storage::probe(path).map_or(false, |g| g.erase_required());
        DtbBackend {
            path: path.into(),
            of_path: of_path.into(),
            need_erase,
        }
    }

    /// The backing file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The backing device's node path in the device tree.
    #[must_use]
    pub fn of_path(&self) -> &str {
        &self.of_path
    }

    /// Read the file, unflatten it, and import the values it carries.
    ///
    /// # Errors
    /// I/O and decode failures, plus schema rejections (foreign magic).
    pub(crate) fn load(&self, magic: u32, vars: &mut [Variable]) -> Result<()> {
        let blob = fs::read(&self.path).with_context(|_| IoSnafu {
            path: self.path.display().to_string(),
        })?;
        let tree = fdt::unflatten(&blob).context(DecodeSnafu)?;
        state::import_tree(&tree, tree.root(), magic, vars).context(ImportSnafu)
    }

    /// Flatten `tree` and overwrite the file, erasing first when required.
    ///
    /// # Errors
    /// Erase or write failures.
    pub(crate) fn save(&self, tree: &Tree) -> Result<()> {
        let blob = fdt::flatten(tree);
        let io_ctx = || IoSnafu {
            path: self.path.display().to_string(),
        };
        let file = OpenOptions::new()
            .write(true)
            .open(&self.path)
            .with_context(|_| io_ctx())?;
        if self.need_erase {
            storage::erase(&file, &self.path, 0, blob.len() as u64).context(MediumSnafu)?;
        }
        file.write_all_at(&blob, 0).with_context(|_| io_ctx())?;
        file.sync_data().with_context(|_| io_ctx())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device_tree::Tree;
    use crate::state::{Convert, State};

    fn sample_state() -> (Tree, State) {
        let mut tree = Tree::new();
        let node = tree.add_node(tree.root(), "state");
        tree.write_u32(node, "magic", 0x5717_beef);
        let serial = tree.add_node(node, "serial@0");
        tree.write_string(serial, "type", "string");
        tree.write_u32_array(serial, "reg", &[0, 16]);
        let counter = tree.add_node(node, "counter@10");
        tree.write_string(counter, "type", "uint32");
        tree.write_u32_array(counter, "reg", &[16, 4]);
        let state = State::from_node(&tree, node, "state").expect("assemble");
        (tree, state)
    }

    #[test]
    fn save_then_load_round_trips_values() {
        let (_tree, mut state) = sample_state();
        state.set("serial", "ABC-123").expect("set serial");
        state.set("counter", "77").expect("set counter");

        let file = tempfile::NamedTempFile::new().expect("tempfile");
        let dtb = DtbBackend::configure(file.path(), "/storage");
        dtb.save(&state.to_tree(Convert::ToNode)).expect("save");

        let (_tree2, reloaded) = sample_state();
        let mut vars: Vec<Variable> = reloaded.variables().cloned().collect();
        dtb.load(0x5717_beef, &mut vars).expect("load");
        let serial = vars.iter().find(|v| v.name == "serial").unwrap();
        assert_eq!(serial.get().unwrap(), "ABC-123");
        let counter = vars.iter().find(|v| v.name == "counter").unwrap();
        assert_eq!(counter.get().unwrap(), "77");
    }

    #[test]
    fn foreign_magic_is_rejected() {
        let (_tree, state) = sample_state();
        let file = tempfile::NamedTempFile::new().expect("tempfile");
        let dtb = DtbBackend::configure(file.path(), "/storage");
        dtb.save(&state.to_tree(Convert::ToNode)).expect("save");

        let mut vars: Vec<Variable> = state.variables().cloned().collect();
        assert!(matches!(
            dtb.load(0x1111_1111, &mut vars),
            Err(super::super::Error::Import { .. })
        ));
    }

    #[test]
    fn truncated_blob_is_rejected_by_structure_checks() {
        let (_tree, state) = sample_state();
        let file = tempfile::NamedTempFile::new().expect("tempfile");
        let dtb = DtbBackend::configure(file.path(), "/storage");
        dtb.save(&state.to_tree(Convert::ToNode)).expect("save");

        let blob = fs::read(file.path()).unwrap();
        fs::write(file.path(), &blob[..blob.len() / 2]).unwrap();

        let mut vars: Vec<Variable> = state.variables().cloned().collect();
        assert!(matches!(
            dtb.load(0x5717_beef, &mut vars),
            Err(super::super::Error::Decode { .. })
        ));
    }
}
