//! In-memory device tree.
//!
//! The tree is an owned arena of nodes addressed by [`NodeId`]. Unlike a
//! zero-copy blob reader this representation can be freely mutated, which the
//! state machinery needs for schema export, fixup and DTB serialisation.
//! Property values are plain byte strings; typed accessors interpret them
//! big-endian as the device tree wire format demands.

use byteorder::{BigEndian, ByteOrder};
use hashbrown::HashMap;
use snafu::{ensure, Snafu};

pub mod fdt;
pub mod sysfs;

/// Errors produced by typed property access.
#[derive(Debug, Snafu, Clone, PartialEq, Eq)]
pub enum PropertyError {
    /// The property does not exist on the node.
    #[snafu(display("property {name:?} not found"))]
    NotFound {
        /// Name of the missing property.
        name: String,
    },
    /// The property exists but its value has the wrong size for the requested type.
    #[snafu(display("property {name:?} has length {actual}, expected {expected}"))]
    WrongLength {
        /// Name of the offending property.
        name: String,
        /// Length the requested interpretation needs.
        expected: usize,
        /// Length actually found.
        actual: usize,
    },
    /// The property exists but cannot be interpreted as requested.
    #[snafu(display("property {name:?} is not a valid {what}"))]
    Malformed {
        /// Name of the offending property.
        name: String,
        /// What the caller tried to read it as.
        what: &'static str,
    },
    /// A list property has fewer elements than the requested index.
    #[snafu(display("property {name:?} has no element {index}"))]
    NoSuchIndex {
        /// Name of the offending property.
        name: String,
        /// The requested element.
        index: usize,
    },
}

type Result<T, E = PropertyError> = core::result::Result<T, E>;

/// Handle to a node within a [`Tree`].
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct NodeId(usize);

/// A named property holding an uninterpreted byte string.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Property {
    /// Property name.
    pub name: String,
    /// Raw value bytes (big-endian cells, NUL-terminated strings, or blobs).
    pub value: Vec<u8>,
}

#[derive(Debug)]
struct Node {
    name: String,
    path: String,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    properties: Vec<Property>,
    phandle: Option<u32>,
}

/// An entry in the alias index, built by [`Tree::alias_scan`].
#[derive(Clone, Debug)]
pub struct Alias {
    /// The node the alias points at.
    pub node: NodeId,
    /// Alias name with the trailing decimal id removed.
    pub stem: String,
    /// The trailing decimal id (0 if the alias carries none).
    pub id: u32,
}

/// An owned, mutable device tree.
#[derive(Debug)]
pub struct Tree {
    nodes: Vec<Node>,
    aliases: HashMap<String, Alias>,
}

impl Default for Tree {
    fn default() -> Self {
        Self::new()
    }
}

impl Tree {
    /// Create a tree holding only an unnamed root node.
    #[must_use]
    pub fn new() -> Self {
        Tree {
            nodes: vec![Node {
                name: String::new(),
                path: "/".into(),
                parent: None,
                children: Vec::new(),
                properties: Vec::new(),
                phandle: None,
            }],
            aliases: HashMap::new(),
        }
    }

    /// The root node.
    #[must_use]
    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    /// Attach a new child to `parent`, preserving sibling insertion order.
    pub fn add_node(&mut self, parent: NodeId, name: &str) -> NodeId {
        let path = if self.nodes[parent.0].parent.is_none() {
            format!("/{name}")
        } else {
            format!("{}/{name}", self.nodes[parent.0].path)
        };
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            name: name.into(),
            path,
            parent: Some(parent),
            children: Vec::new(),
            properties: Vec::new(),
            phandle: None,
        });
        self.nodes[parent.0].children.push(id);
        id
    }

    /// Detach `node` (and its subtree) from its parent. The root cannot be
    /// removed.
    pub fn remove_node(&mut self, node: NodeId) {
        if let Some(parent) = self.nodes[node.0].parent.take() {
            self.nodes[parent.0].children.retain(|c| *c != node);
        }
    }

    /// The node's own name (`""` for the root).
    #[must_use]
    pub fn name(&self, node: NodeId) -> &str {
        &self.nodes[node.0].name
    }

    /// The node's name with any `@<unit-address>` suffix removed.
    #[must_use]
    pub fn base_name(&self, node: NodeId) -> &str {
        let name = self.name(node);
        name.split_once('@').map_or(name, |(base, _)| base)
    }

    /// The node's full path from the root.
    #[must_use]
    pub fn path(&self, node: NodeId) -> &str {
        &self.nodes[node.0].path
    }

    /// The node's parent, if it has one.
    #[must_use]
    pub fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.nodes[node.0].parent
    }

    /// The node's children in insertion order.
    #[must_use]
    pub fn children(&self, node: NodeId) -> &[NodeId] {
        &self.nodes[node.0].children
    }

    /// The node's phandle, if one is known.
    #[must_use]
    pub fn phandle(&self, node: NodeId) -> Option<u32> {
        self.nodes[node.0].phandle
    }

    /// Record `phandle` on the node (field only, not the property).
    pub fn set_phandle(&mut self, node: NodeId, phandle: u32) {
        self.nodes[node.0].phandle = Some(phandle);
    }

    /// Iterate the node's properties.
    pub fn properties(&self, node: NodeId) -> impl Iterator<Item = &Property> {
        self.nodes[node.0].properties.iter()
    }

    /// Add a property, replacing any existing one of the same name.
    pub fn set_property(&mut self, node: NodeId, name: &str, value: Vec<u8>) {
        let props = &mut self.nodes[node.0].properties;
        match props.iter_mut().find(|p| p.name == name) {
            Some(p) => p.value = value,
            None => props.push(Property {
                name: name.into(),
                value,
            }),
        }
    }

    /// Delete a property. Returns whether it existed.
    pub fn delete_property(&mut self, node: NodeId, name: &str) -> bool {
        let props = &mut self.nodes[node.0].properties;
        let before = props.len();
        props.retain(|p| p.name != name);
        props.len() != before
    }

    /// Whether the node carries the named property.
    #[must_use]
    pub fn has_property(&self, node: NodeId, name: &str) -> bool {
        self.nodes[node.0].properties.iter().any(|p| p.name == name)
    }

    /// Raw value of the named property.
    ///
    /// # Errors
    /// [`PropertyError::NotFound`] if the node has no such property.
    pub fn property(&self, node: NodeId, name: &str) -> Result<&[u8]> {
        self.nodes[node.0]
            .properties
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.value.as_slice())
            .ok_or_else(|| PropertyError::NotFound { name: name.into() })
    }

    fn property_sized(&self, node: NodeId, name: &str, len: usize) -> Result<&[u8]> {
        let value = self.property(node, name)?;
        ensure!(
            value.len() == len,
            WrongLengthSnafu {
                name,
                expected: len,
                actual: value.len()
            }
        );
        Ok(value)
    }

    /// Read a single big-endian u32 cell.
    ///
    /// # Errors
    /// Not-found or wrong-length sentinels from [`PropertyError`].
    pub fn read_u32(&self, node: NodeId, name: &str) -> Result<u32> {
        Ok(BigEndian::read_u32(self.property_sized(node, name, 4)?))
    }

    /// Read a big-endian u64 spanning two cells.
    ///
    /// # Errors
    /// Not-found or wrong-length sentinels from [`PropertyError`].
    pub fn read_u64(&self, node: NodeId, name: &str) -> Result<u64> {
        Ok(BigEndian::read_u64(self.property_sized(node, name, 8)?))
    }

    /// Read `count` big-endian u32 cells.
    ///
    /// # Errors
    /// Not-found or wrong-length sentinels from [`PropertyError`].
    pub fn read_u32_array(&self, node: NodeId, name: &str, count: usize) -> Result<Vec<u32>> {
        let value = self.property_sized(node, name, count * 4)?;
        Ok(value.chunks_exact(4).map(BigEndian::read_u32).collect())
    }

    /// Read a byte array of exactly `count` elements.
    ///
    /// # Errors
    /// Not-found or wrong-length sentinels from [`PropertyError`].
    pub fn read_u8_array(&self, node: NodeId, name: &str, count: usize) -> Result<Vec<u8>> {
        Ok(self.property_sized(node, name, count)?.to_vec())
    }

    /// Read the first NUL-terminated string of the property.
    ///
    /// # Errors
    /// [`PropertyError::Malformed`] if the value carries no terminator or is
    /// not UTF-8.
    pub fn read_string(&self, node: NodeId, name: &str) -> Result<&str> {
        self.read_string_index(node, name, 0)
    }

    /// Read the `index`th NUL-terminated string of a string-list property.
    ///
    /// # Errors
    /// Not-found, malformed, or index-out-of-range sentinels.
    pub fn read_string_index(&self, node: NodeId, name: &str, index: usize) -> Result<&str> {
        let value = self.property(node, name)?;
        string_list(value, name)?
            .nth(index)
            .ok_or_else(|| PropertyError::NoSuchIndex {
                name: name.into(),
                index,
            })
    }

    /// Number of strings in a string-list property.
    ///
    /// # Errors
    /// Not-found or malformed sentinels.
    pub fn count_strings(&self, node: NodeId, name: &str) -> Result<usize> {
        let value = self.property(node, name)?;
        Ok(string_list(value, name)?.count())
    }

    /// Whether a boolean (presence-only) property is set.
    #[must_use]
    pub fn read_bool(&self, node: NodeId, name: &str) -> bool {
        self.has_property(node, name)
    }

    /// Write a u32 cell, big-endian.
    pub fn write_u32(&mut self, node: NodeId, name: &str, value: u32) {
        let mut buf = [0u8; 4];
        BigEndian::write_u32(&mut buf, value);
        self.set_property(node, name, buf.to_vec());
    }

    /// Write an array of u32 cells, big-endian.
    pub fn write_u32_array(&mut self, node: NodeId, name: &str, values: &[u32]) {
        let mut buf = vec![0u8; values.len() * 4];
        for (chunk, value) in buf.chunks_exact_mut(4).zip(values) {
            BigEndian::write_u32(chunk, *value);
        }
        self.set_property(node, name, buf);
    }

    /// Write a byte array property.
    pub fn write_u8_array(&mut self, node: NodeId, name: &str, values: &[u8]) {
        self.set_property(node, name, values.to_vec());
    }

    /// Write a NUL-terminated string property.
    pub fn write_string(&mut self, node: NodeId, name: &str, value: &str) {
        let mut buf = Vec::with_capacity(value.len() + 1);
        buf.extend_from_slice(value.as_bytes());
        buf.push(0);
        self.set_property(node, name, buf);
    }

    /// Write a string-list property (each entry NUL-terminated).
    pub fn write_string_list<S: AsRef<str>>(&mut self, node: NodeId, name: &str, values: &[S]) {
        let mut buf = Vec::new();
        for value in values {
            buf.extend_from_slice(value.as_ref().as_bytes());
            buf.push(0);
        }
        self.set_property(node, name, buf);
    }

    /// Find a node by full path.
    #[must_use]
    pub fn find_by_path(&self, path: &str) -> Option<NodeId> {
        let mut cur = self.root();
        for component in path.split('/').filter(|c| !c.is_empty()) {
            cur = *self.nodes[cur.0]
                .children
                .iter()
                .find(|c| self.nodes[c.0].name == component)?;
        }
        Some(cur)
    }

    /// Find a node by full path (leading `/`) or by alias name.
    #[must_use]
    pub fn find_by_path_or_alias(&self, reference: &str) -> Option<NodeId> {
        if reference.starts_with('/') {
            self.find_by_path(reference)
        } else {
            self.aliases.get(reference).map(|a| a.node)
        }
    }

    /// Look up an alias entry by its full alias name.
    #[must_use]
    pub fn alias(&self, name: &str) -> Option<&Alias> {
        self.aliases.get(name)
    }

    /// Rebuild the alias index from the `/aliases` node.
    ///
    /// Each property of `/aliases` whose value is a valid node path is
    /// indexed. The alias id is the trailing decimal of the alias name; the
    /// stem is the alias name with that decimal removed.
    pub fn alias_scan(&mut self) {
        self.aliases.clear();
        let Some(aliases) = self.find_by_path("/aliases") else {
            return;
        };
        let entries: Vec<(String, Vec<u8>)> = self
            .properties(aliases)
            .filter(|p| !matches!(p.name.as_str(), "name" | "phandle" | "linux,phandle"))
            .map(|p| (p.name.clone(), p.value.clone()))
            .collect();
        for (name, value) in entries {
            let Some(path) = value
                .split_last()
                .filter(|(last, _)| **last == 0)
                .and_then(|(_, body)| core::str::from_utf8(body).ok())
            else {
                continue;
            };
            let Some(node) = self.find_by_path(path) else {
                continue;
            };
            let stem_end = name
                .rfind(|c: char| !c.is_ascii_digit())
                .map_or(0, |i| i + 1);
            let id = name[stem_end..].parse().unwrap_or(0);
            let stem = name[..stem_end].to_string();
            log::debug!("alias {name}: stem={stem} id={id} node={path}");
            self.aliases.insert(name, Alias { node, stem, id });
        }
    }

    /// Find the node carrying the given phandle.
    #[must_use]
    pub fn find_by_phandle(&self, phandle: u32) -> Option<NodeId> {
        self.iter().find(|n| self.phandle(*n) == Some(phandle))
    }

    /// Find the next node (in pre-order, after `cursor` if given) with the
    /// given name.
    #[must_use]
    pub fn find_by_name(&self, cursor: Option<NodeId>, name: &str) -> Option<NodeId> {
        self.iter_after(cursor).find(|n| self.name(*n) == name)
    }

    /// Find the next node (after `cursor`) whose `compatible` list contains
    /// `token`.
    #[must_use]
    pub fn find_compatible(&self, cursor: Option<NodeId>, token: &str) -> Option<NodeId> {
        self.iter_after(cursor).find(|n| self.is_compatible(*n, token))
    }

    /// Find the next node (after `cursor`) matching any of the compatible
    /// `tokens`, returning the node and the matched token.
    #[must_use]
    pub fn find_matching<'t>(
        &self,
        cursor: Option<NodeId>,
        tokens: &[&'t str],
    ) -> Option<(NodeId, &'t str)> {
        self.iter_after(cursor).find_map(|n| {
            tokens
                .iter()
                .find(|t| self.is_compatible(n, t))
                .map(|t| (n, *t))
        })
    }

    /// Find the next node (after `cursor`) carrying the named property.
    #[must_use]
    pub fn find_with_property(&self, cursor: Option<NodeId>, name: &str) -> Option<NodeId> {
        self.iter_after(cursor).find(|n| self.has_property(*n, name))
    }

    /// Whether the node's `compatible` list contains `token` exactly.
    #[must_use]
    pub fn is_compatible(&self, node: NodeId, token: &str) -> bool {
        let Ok(value) = self.property(node, "compatible") else {
            return false;
        };
        let Ok(mut list) = string_list(value, "compatible") else {
            return false;
        };
        list.any(|s| s == token)
    }

    /// Whether the node is available: `status` absent or `"okay"`/`"ok"`.
    #[must_use]
    pub fn is_available(&self, node: NodeId) -> bool {
        match self.read_string(node, "status") {
            Ok(status) => status == "okay" || status == "ok",
            Err(PropertyError::NotFound { .. }) => true,
            Err(_) => false,
        }
    }

    /// `#address-cells` in effect for children of `node`'s parent chain.
    #[must_use]
    pub fn addr_cells(&self, node: NodeId) -> usize {
        self.cells_of(node, "#address-cells")
    }

    /// `#size-cells` in effect for children of `node`'s parent chain.
    #[must_use]
    pub fn size_cells(&self, node: NodeId) -> usize {
        self.cells_of(node, "#size-cells")
    }

    fn cells_of(&self, node: NodeId, name: &str) -> usize {
        let mut cur = self.parent(node);
        while let Some(n) = cur {
            if let Ok(cells) = self.read_u32(n, name) {
                return cells as usize;
            }
            cur = self.parent(n);
        }
        1
    }

    /// Read the node's `reg` property as an `(address, size)` pair using the
    /// parent's cell widths.
    ///
    /// # Errors
    /// Not-found or wrong-length sentinels.
    pub fn read_reg(&self, node: NodeId) -> Result<(u64, u64)> {
        let a_cells = self.addr_cells(node);
        let s_cells = self.size_cells(node);
        let value = self.property_sized(node, "reg", (a_cells + s_cells) * 4)?;
        Ok((
            read_number(&value[..a_cells * 4]),
            read_number(&value[a_cells * 4..]),
        ))
    }

    /// Resolve a phandle-valued property to the node it references.
    #[must_use]
    pub fn parse_phandle(&self, node: NodeId, name: &str) -> Option<NodeId> {
        let phandle = self.read_u32(node, name).ok()?;
        self.find_by_phandle(phandle)
    }

    /// Return the node's phandle, allocating `max + 1` and writing the
    /// `phandle` property if it has none yet.
    pub fn create_phandle(&mut self, node: NodeId) -> u32 {
        if let Some(phandle) = self.phandle(node) {
            return phandle;
        }
        let next = self
            .iter()
            .filter_map(|n| self.phandle(n))
            .max()
            .unwrap_or(0)
            + 1;
        self.set_phandle(node, next);
        self.write_u32(node, "phandle", next);
        next
    }

    /// Iterate the whole tree in pre-order.
    pub fn iter(&self) -> impl Iterator<Item = NodeId> + '_ {
        Preorder {
            tree: self,
            stack: vec![self.root()],
        }
    }

    /// Iterate pre-order, starting strictly after `cursor` (or from the root
    /// when no cursor is given).
    pub fn iter_after(&self, cursor: Option<NodeId>) -> impl Iterator<Item = NodeId> + '_ {
        let skip = cursor.map(|c| {
            self.iter()
                .position(|n| n == c)
                .map_or(usize::MAX, |i| i + 1)
        });
        self.iter().skip(skip.unwrap_or(0))
    }

    /// Render the subtree at `node` in source form, for diagnostics.
    #[must_use]
    pub fn render(&self, node: NodeId) -> String {
        let mut out = String::new();
        self.render_into(node, 0, &mut out);
        out
    }

    fn render_into(&self, node: NodeId, depth: usize, out: &mut String) {
        use core::fmt::Write;
        let indent = "\t".repeat(depth);
        let name = if self.nodes[node.0].parent.is_none() {
            "/"
        } else {
            self.name(node)
        };
        let _ = writeln!(out, "{indent}{name} {{");
        for prop in self.properties(node) {
            let _ = writeln!(out, "{indent}\t{};", render_property(prop));
        }
        for child in self.children(node) {
            self.render_into(*child, depth + 1, out);
        }
        let _ = writeln!(out, "{indent}}};");
    }
}

/// Big-endian number spanning one or more 4-byte cells.
fn read_number(cells: &[u8]) -> u64 {
    cells
        .chunks_exact(4)
        .fold(0u64, |acc, c| (acc << 32) | u64::from(BigEndian::read_u32(c)))
}

/// Iterate the NUL-terminated strings of a property value.
fn string_list<'v>(
    value: &'v [u8],
    name: &str,
) -> Result<impl Iterator<Item = &'v str> + 'v> {
    ensure!(
        value.last() == Some(&0),
        MalformedSnafu {
            name,
            what: "string list"
        }
    );
    let body = &value[..value.len() - 1];
    ensure!(
        core::str::from_utf8(body).is_ok(),
        MalformedSnafu {
            name,
            what: "string list"
        }
    );
    Ok(body
        .split(|b| *b == 0)
        .map(|s| core::str::from_utf8(s).unwrap_or_default()))
}

fn render_property(prop: &Property) -> String {
    if prop.value.is_empty() {
        return prop.name.clone();
    }
    if let Ok(mut strings) = string_list(&prop.value, &prop.name) {
        if strings.all(|s| !s.is_empty() && s.chars().all(|c| !c.is_control())) {
            let joined = string_list(&prop.value, &prop.name)
                .map(|l| l.map(|s| format!("{s:?}")).collect::<Vec<_>>().join(", "))
                .unwrap_or_default();
            return format!("{} = {joined}", prop.name);
        }
    }
    if prop.value.len() % 4 == 0 {
        let cells = prop
            .value
            .chunks_exact(4)
            .map(|c| format!("0x{:x}", BigEndian::read_u32(c)))
            .collect::<Vec<_>>()
            .join(" ");
        return format!("{} = <{cells}>", prop.name);
    }
    let bytes = prop
        .value
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ");
    format!("{} = [{bytes}]", prop.name)
}

struct Preorder<'t> {
    tree: &'t Tree,
    stack: Vec<NodeId>,
}

impl Iterator for Preorder<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<Self::Item> {
        let next = self.stack.pop()?;
        self.stack
            .extend(self.tree.children(next).iter().rev().copied());
        Some(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree() -> Tree {
        let mut tree = Tree::new();
        let state = tree.add_node(tree.root(), "state");
        tree.write_u32(state, "magic", 0xdead_beef);
        let counter = tree.add_node(state, "counter");
        tree.write_string(counter, "type", "uint32");
        tree.write_u32_array(counter, "reg", &[0, 4]);
        let flash = tree.add_node(tree.root(), "flash@0");
        tree.write_string(flash, "compatible", "cfi-flash");
        tree
    }

    #[test]
    fn path_lookup() {
        let tree = sample_tree();
        let counter = tree.find_by_path("/state/counter").expect("counter node");
        assert_eq!(tree.name(counter), "counter");
        assert_eq!(tree.path(counter), "/state/counter");
        assert!(tree.find_by_path("/state/missing").is_none());
        assert_eq!(tree.find_by_path("/"), Some(tree.root()));
    }

    #[test]
    fn property_sentinels_are_distinct() {
        let tree = sample_tree();
        let state = tree.find_by_path("/state").unwrap();
        assert!(matches!(
            tree.read_u32(state, "nonexistent"),
            Err(PropertyError::NotFound { .. })
        ));
        let counter = tree.find_by_path("/state/counter").unwrap();
        assert!(matches!(
            tree.read_u32(counter, "reg"),
            Err(PropertyError::WrongLength {
                expected: 4,
                actual: 8,
                ..
            })
        ));
    }

    #[test]
    fn typed_round_trips() {
        let mut tree = Tree::new();
        let n = tree.add_node(tree.root(), "n");
        tree.write_u32(n, "cell", 0x1234_5678);
        assert_eq!(tree.read_u32(n, "cell").unwrap(), 0x1234_5678);
        // big-endian on the wire
        assert_eq!(tree.property(n, "cell").unwrap(), &[0x12, 0x34, 0x56, 0x78]);

        tree.write_string_list(n, "names", &["red", "green", "blue"]);
        assert_eq!(tree.count_strings(n, "names").unwrap(), 3);
        assert_eq!(tree.read_string_index(n, "names", 1).unwrap(), "green");
        assert!(matches!(
            tree.read_string_index(n, "names", 3),
            Err(PropertyError::NoSuchIndex { index: 3, .. })
        ));

        tree.write_u8_array(n, "mac", &[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
        assert_eq!(tree.read_u8_array(n, "mac", 6).unwrap().len(), 6);
    }

    #[test]
    fn compatible_matching() {
        let tree = sample_tree();
        let flash = tree.find_compatible(None, "cfi-flash").expect("flash");
        assert_eq!(tree.name(flash), "flash@0");
        assert!(tree.find_compatible(Some(flash), "cfi-flash").is_none());
        assert!(tree.find_compatible(None, "cfi").is_none());
    }

    #[test]
    fn cursor_iteration_skips_start_node() {
        let mut tree = Tree::new();
        let a = tree.add_node(tree.root(), "dev");
        let _b = tree.add_node(a, "dev");
        let c = tree.add_node(tree.root(), "dev");
        let first = tree.find_by_name(None, "dev").unwrap();
        assert_eq!(first, a);
        let second = tree.find_by_name(Some(first), "dev").unwrap();
        assert_ne!(second, first);
        let third = tree.find_by_name(Some(second), "dev").unwrap();
        assert_eq!(third, c);
        assert!(tree.find_by_name(Some(third), "dev").is_none());
    }

    #[test]
    fn alias_scan_indexes_stems_and_ids() {
        let mut tree = sample_tree();
        let aliases = tree.add_node(tree.root(), "aliases");
        tree.write_string(aliases, "state0", "/state");
        tree.write_string(aliases, "bogus", "/does/not/exist");
        tree.alias_scan();

        let alias = tree.alias("state0").expect("state0 alias");
        assert_eq!(alias.stem, "state");
        assert_eq!(alias.id, 0);
        assert_eq!(tree.path(alias.node), "/state");
        assert!(tree.alias("bogus").is_none());

        assert_eq!(
            tree.find_by_path_or_alias("state0"),
            tree.find_by_path("/state")
        );
        assert_eq!(
            tree.find_by_path_or_alias("/state"),
            tree.find_by_path("/state")
        );
    }

    #[test]
    fn phandle_allocation_takes_max_plus_one() {
        let mut tree = sample_tree();
        let flash = tree.find_by_path("/flash@0").unwrap();
        tree.set_phandle(flash, 7);
        let state = tree.find_by_path("/state").unwrap();
        let new = tree.create_phandle(state);
        assert_eq!(new, 8);
        assert_eq!(tree.read_u32(state, "phandle").unwrap(), 8);
        assert_eq!(tree.find_by_phandle(8), Some(state));
        // stable on second call
        assert_eq!(tree.create_phandle(state), 8);
    }

    #[test]
    fn reg_uses_parent_cells() {
        let mut tree = Tree::new();
        let bus = tree.add_node(tree.root(), "bus");
        tree.write_u32(bus, "#address-cells", 2);
        tree.write_u32(bus, "#size-cells", 1);
        let part = tree.add_node(bus, "partition@100000");
        tree.write_u32_array(part, "reg", &[0x1, 0x0010_0000, 0x4000]);
        assert_eq!(tree.read_reg(part).unwrap(), (0x1_0010_0000, 0x4000));
    }

    #[test]
    fn remove_node_detaches_subtree() {
        let mut tree = sample_tree();
        let state = tree.find_by_path("/state").unwrap();
        tree.remove_node(state);
        assert!(tree.find_by_path("/state").is_none());
        assert!(tree.find_by_path("/state/counter").is_none());
    }

    #[test]
    fn render_shows_strings_and_cells() {
        let tree = sample_tree();
        let out = tree.render(tree.find_by_path("/state").unwrap());
        assert!(out.contains("magic = <0xdeadbeef>"));
        assert!(out.contains("type = \"uint32\""));
    }
}
