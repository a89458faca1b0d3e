//! Flattened device tree blob format.
//!
//! Unflattening turns a blob into an owned [`Tree`]; flattening serialises a
//! [`Tree`] back into a version-17 blob. All blob fields are big-endian.

use byteorder::{BigEndian, ByteOrder};
use hashbrown::HashMap;
use snafu::{ensure, Snafu};

use super::Tree;

/// The magic value expected in the device tree header.
pub const EXPECTED_MAGIC: u32 = 0xd00d_feed;

/// Blob version written by [`flatten`].
const VERSION: u32 = 17;
/// Oldest version [`flatten`] output stays compatible with.
const LAST_COMP_VERSION: u32 = 16;

const HEADER_LEN: usize = 40;

/// Values used to delimit structure in the flattened device tree.
#[repr(u32)]
enum TokenType {
    /// Beginning of a node's representation.
    BeginNode = 0x01,
    /// End of a node's representation.
    EndNode = 0x02,
    /// A node property.
    Prop = 0x03,
    /// Ignored during parsing.
    Nop = 0x04,
    /// Marks the end of the tree structure.
    End = 0x09,
}

/// Errors found while decoding a blob.
#[derive(Debug, Snafu)]
pub enum FdtError {
    /// The header magic does not match [`EXPECTED_MAGIC`].
    #[snafu(display("bad FDT magic 0x{found:08x}"))]
    BadMagic {
        /// The magic value actually present.
        found: u32,
    },
    /// The buffer ends before the structure it claims to hold.
    #[snafu(display("truncated FDT blob ({what})"))]
    Truncated {
        /// Which part of the blob ran short.
        what: &'static str,
    },
    /// The blob is too old or too new to decode.
    #[snafu(display("unsupported FDT version {version}"))]
    UnsupportedVersion {
        /// The last compatible version claimed by the header.
        version: u32,
    },
    /// An undefined token appeared in the structure block.
    #[snafu(display("unknown FDT token 0x{token:08x} at offset {offset}"))]
    UnknownToken {
        /// The token value.
        token: u32,
        /// Byte offset within the structure block.
        offset: usize,
    },
    /// Node begin/end tokens do not nest properly.
    #[snafu(display("unbalanced FDT structure"))]
    Unbalanced,
}

type Result<T, E = FdtError> = core::result::Result<T, E>;

/// Device tree blob header, read field-by-field out of the raw bytes.
#[derive(Copy, Clone)]
pub struct BlobHeader<'a> {
    /// Raw bytes that make up the header.
    pub buf: &'a [u8],
}

impl BlobHeader<'_> {
    /// Magic number. Should equal [`EXPECTED_MAGIC`].
    #[must_use]
    pub fn magic(&self) -> u32 {
        BigEndian::read_u32(&self.buf[0..])
    }
    /// Total size of the blob.
    #[must_use]
    pub fn total_size(&self) -> u32 {
        BigEndian::read_u32(&self.buf[4..])
    }
    /// Offset to the structs region of the blob.
    #[must_use]
    pub fn off_dt_struct(&self) -> u32 {
        BigEndian::read_u32(&self.buf[8..])
    }
    /// Offset to the strings region of the blob.
    #[must_use]
    pub fn off_dt_strings(&self) -> u32 {
        BigEndian::read_u32(&self.buf[12..])
    }
    /// Offset to the memory reservation block.
    #[must_use]
    pub fn off_mem_rsvmap(&self) -> u32 {
        BigEndian::read_u32(&self.buf[16..])
    }
    /// Blob version code.
    #[must_use]
    pub fn version(&self) -> u32 {
        BigEndian::read_u32(&self.buf[20..])
    }
    /// Oldest version this blob is compatible with.
    #[must_use]
    pub fn last_comp_version(&self) -> u32 {
        BigEndian::read_u32(&self.buf[24..])
    }
    /// Size of the strings region of the blob.
    #[must_use]
    pub fn size_dt_strings(&self) -> u32 {
        BigEndian::read_u32(&self.buf[32..])
    }
    /// Size of the structs region of the blob.
    #[must_use]
    pub fn size_dt_struct(&self) -> u32 {
        BigEndian::read_u32(&self.buf[36..])
    }
}

fn pad_4(n: usize) -> usize {
    n.div_ceil(4) * 4
}

/// Decode a flattened blob into an owned [`Tree`].
///
/// `phandle`/`linux,phandle` properties also populate the node's phandle
/// field, and the alias index is rebuilt before returning.
///
/// # Errors
/// Any [`FdtError`] the blob provokes; the tree's own structure checks are
/// all the validation DTB-backed state gets, so decoding is strict.
pub fn unflatten(blob: &[u8]) -> Result<Tree> {
    ensure!(blob.len() >= HEADER_LEN, TruncatedSnafu { what: "header" });
    let header = BlobHeader { buf: blob };
    ensure!(
        header.magic() == EXPECTED_MAGIC,
        BadMagicSnafu {
            found: header.magic()
        }
    );
    ensure!(
        header.total_size() as usize <= blob.len(),
        TruncatedSnafu { what: "blob body" }
    );
    ensure!(
        header.last_comp_version() <= VERSION && header.version() >= LAST_COMP_VERSION,
        UnsupportedVersionSnafu {
            version: header.last_comp_version()
        }
    );

    let limit = header.total_size() as usize;
    let structure = blob
        .get(header.off_dt_struct() as usize..limit)
        .ok_or(FdtError::Truncated { what: "structure" })?;
    let strings = blob
        .get(header.off_dt_strings() as usize..limit)
        .ok_or(FdtError::Truncated { what: "strings" })?;

    let mut tree = Tree::new();
    let mut stack = Vec::new();
    let mut offset = 0usize;
    loop {
        ensure!(
            offset + 4 <= structure.len(),
            TruncatedSnafu { what: "token" }
        );
        let token = BigEndian::read_u32(&structure[offset..]);
        offset += 4;
        match token {
            t if t == TokenType::BeginNode as u32 => {
                let name_end = structure[offset..]
                    .iter()
                    .position(|b| *b == 0)
                    .map(|p| offset + p)
                    .ok_or(FdtError::Truncated { what: "node name" })?;
                let name = core::str::from_utf8(&structure[offset..name_end])
                    .map_err(|_| FdtError::Truncated { what: "node name" })?;
                let node = if stack.is_empty() {
                    tree.root()
                } else {
                    tree.add_node(*stack.last().ok_or(FdtError::Unbalanced)?, name)
                };
                stack.push(node);
                offset = pad_4(name_end + 1);
            }
            t if t == TokenType::EndNode as u32 => {
                stack.pop().ok_or(FdtError::Unbalanced)?;
            }
            t if t == TokenType::Prop as u32 => {
                ensure!(
                    offset + 8 <= structure.len(),
                    TruncatedSnafu { what: "property" }
                );
                let len = BigEndian::read_u32(&structure[offset..]) as usize;
                let name_off = BigEndian::read_u32(&structure[offset + 4..]) as usize;
                offset += 8;
                ensure!(
                    offset + len <= structure.len(),
                    TruncatedSnafu {
                        what: "property value"
                    }
                );
                let name_end = strings
                    .get(name_off..)
                    .and_then(|tail| tail.iter().position(|b| *b == 0))
                    .map(|p| name_off + p)
                    .ok_or(FdtError::Truncated {
                        what: "property name",
                    })?;
                let name = core::str::from_utf8(&strings[name_off..name_end]).map_err(|_| {
                    FdtError::Truncated {
                        what: "property name",
                    }
                })?;
                let value = structure[offset..offset + len].to_vec();
                let node = *stack.last().ok_or(FdtError::Unbalanced)?;
                if (name == "phandle" || name == "linux,phandle") && value.len() == 4 {
                    tree.set_phandle(node, BigEndian::read_u32(&value));
                }
                tree.set_property(node, name, value);
                offset = pad_4(offset + len);
            }
            t if t == TokenType::Nop as u32 => {}
            t if t == TokenType::End as u32 => break,
            other => {
                return UnknownTokenSnafu {
                    token: other,
                    offset: offset - 4,
                }
                .fail()
            }
        }
    }
    ensure!(stack.is_empty(), UnbalancedSnafu);

    tree.alias_scan();
    Ok(tree)
}

/// Serialise `tree` into a flattened blob.
#[must_use]
pub fn flatten(tree: &Tree) -> Vec<u8> {
    let mut structure = Vec::new();
    let mut strings = Vec::new();
    let mut interned: HashMap<String, u32> = HashMap::new();
    flatten_node(tree, tree.root(), &mut structure, &mut strings, &mut interned);
    push_token(&mut structure, TokenType::End);

    let off_mem_rsvmap = pad_4(HEADER_LEN).next_multiple_of(8);
    // single terminating reservation entry
    let off_dt_struct = off_mem_rsvmap + 16;
    let off_dt_strings = off_dt_struct + structure.len();
    let total_size = off_dt_strings + strings.len();

    let mut blob = vec![0u8; total_size];
    BigEndian::write_u32(&mut blob[0..], EXPECTED_MAGIC);
    BigEndian::write_u32(&mut blob[4..], total_size as u32);
    BigEndian::write_u32(&mut blob[8..], off_dt_struct as u32);
    BigEndian::write_u32(&mut blob[12..], off_dt_strings as u32);
    BigEndian::write_u32(&mut blob[16..], off_mem_rsvmap as u32);
    BigEndian::write_u32(&mut blob[20..], VERSION);
    BigEndian::write_u32(&mut blob[24..], LAST_COMP_VERSION);
    BigEndian::write_u32(&mut blob[28..], 0); // boot_cpuid_phys
    BigEndian::write_u32(&mut blob[32..], strings.len() as u32);
    BigEndian::write_u32(&mut blob[36..], structure.len() as u32);
    blob[off_dt_struct..off_dt_strings].copy_from_slice(&structure);
    blob[off_dt_strings..].copy_from_slice(&strings);
    blob
}

fn push_token(out: &mut Vec<u8>, token: TokenType) {
    let mut buf = [0u8; 4];
    BigEndian::write_u32(&mut buf, token as u32);
    out.extend_from_slice(&buf);
}

fn flatten_node(
    tree: &Tree,
    node: super::NodeId,
    structure: &mut Vec<u8>,
    strings: &mut Vec<u8>,
    interned: &mut HashMap<String, u32>,
) {
    push_token(structure, TokenType::BeginNode);
    structure.extend_from_slice(tree.name(node).as_bytes());
    structure.push(0);
    structure.resize(pad_4(structure.len()), 0);

    for prop in tree.properties(node) {
        push_token(structure, TokenType::Prop);
        let name_off = *interned.entry(prop.name.clone()).or_insert_with(|| {
            let off = strings.len() as u32;
            strings.extend_from_slice(prop.name.as_bytes());
            strings.push(0);
            off
        });
        let mut buf = [0u8; 8];
        BigEndian::write_u32(&mut buf[0..], prop.value.len() as u32);
        BigEndian::write_u32(&mut buf[4..], name_off);
        structure.extend_from_slice(&buf);
        structure.extend_from_slice(&prop.value);
        structure.resize(pad_4(structure.len()), 0);
    }

    for child in tree.children(node) {
        flatten_node(tree, *child, structure, strings, interned);
    }
    push_token(structure, TokenType::EndNode);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree() -> Tree {
        let mut tree = Tree::new();
        let root = tree.root();
        tree.write_u32(root, "#address-cells", 1);
        let state = tree.add_node(root, "state");
        tree.write_u32(state, "magic", 0x1234_abcd);
        tree.write_string(state, "backend-type", "raw");
        let var = tree.add_node(state, "blue@0");
        tree.write_string(var, "type", "uint32");
        tree.write_u32_array(var, "reg", &[0, 4]);
        let flash = tree.add_node(root, "flash@0");
        tree.set_phandle(flash, 3);
        tree.write_u32(flash, "phandle", 3);
        tree
    }

    fn assert_same(a: &Tree, b: &Tree, na: super::super::NodeId, nb: super::super::NodeId) {
        assert_eq!(a.name(na), b.name(nb));
        assert_eq!(a.phandle(na), b.phandle(nb));
        let pa: Vec<_> = a.properties(na).collect();
        let pb: Vec<_> = b.properties(nb).collect();
        assert_eq!(pa, pb, "properties of {}", a.path(na));
        assert_eq!(a.children(na).len(), b.children(nb).len());
        for (ca, cb) in a.children(na).iter().zip(b.children(nb)) {
            assert_same(a, b, *ca, *cb);
        }
    }

    #[test]
    fn flatten_unflatten_round_trip() {
        let tree = sample_tree();
        let blob = flatten(&tree);
        let back = unflatten(&blob).expect("unflatten");
        assert_same(&tree, &back, tree.root(), back.root());
    }

    #[test]
    fn header_fields_are_consistent() {
        let blob = flatten(&sample_tree());
        let header = BlobHeader { buf: &blob };
        assert_eq!(header.magic(), EXPECTED_MAGIC);
        assert_eq!(header.total_size() as usize, blob.len());
        assert_eq!(header.version(), 17);
        assert_eq!(
            header.off_dt_strings() + header.size_dt_strings(),
            header.total_size()
        );
    }

    #[test]
    fn rejects_bad_magic() {
        let mut blob = flatten(&sample_tree());
        blob[0] ^= 0xff;
        assert!(matches!(unflatten(&blob), Err(FdtError::BadMagic { .. })));
    }

    #[test]
    fn rejects_truncated_blob() {
        let blob = flatten(&sample_tree());
        assert!(matches!(
            unflatten(&blob[..blob.len() - 9]),
            Err(FdtError::Truncated { .. })
        ));
    }

    #[test]
    fn phandles_survive_round_trip() {
        let tree = sample_tree();
        let back = unflatten(&flatten(&tree)).expect("unflatten");
        let flash = back.find_by_path("/flash@0").expect("flash node");
        assert_eq!(back.phandle(flash), Some(3));
        assert_eq!(back.find_by_phandle(3), Some(flash));
    }
}
