//! State instances assembled from a device tree schema.
//!
//! A schema is a sub-graph whose leaves carry a `type` property; every such
//! leaf becomes one typed [`Variable`] at a fixed payload position given by
//! `reg = <start size>`. Intermediate nodes contribute name prefixes only.

use itertools::Itertools;
use snafu::{ensure, OptionExt, ResultExt, Snafu};

mod variable;

pub use variable::{Convert, Variable, VariableKind, STRING_MAX_SIZE};

use crate::backend::Backend;
use crate::device_tree::{NodeId, PropertyError, Tree};

/// Errors from schema assembly and variable access.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// A schema leaf names a type this implementation does not know.
    #[snafu(display("unknown variable type {name:?}"))]
    UnknownType {
        /// The offending type name.
        name: String,
    },
    /// A schema property is missing or ill-formed.
    #[snafu(display("variable {name}: {source}"))]
    Schema {
        /// The variable (or state) the property belongs to.
        name: String,
        /// The underlying property failure.
        source: PropertyError,
    },
    /// The `reg` size does not match the variable type's width.
    #[snafu(display(
        "{name}: size mismatch: type={type_name}(size={expected}) size={actual}"
    ))]
    SizeMismatch {
        /// The offending variable.
        name: String,
        /// Its declared type.
        type_name: String,
        /// Width the type requires.
        expected: u32,
        /// Size the schema declares.
        actual: u32,
    },
    /// A node's `type` disagrees with the variable created earlier.
    #[snafu(display("{name}: type {found}, expected {expected}"))]
    TypeMismatch {
        /// The offending variable.
        name: String,
        /// Type recorded at assembly.
        expected: String,
        /// Type found during import.
        found: String,
    },
    /// Two or more variables occupy overlapping payload regions.
    #[snafu(display("conflicting variable positions between {conflicts}"))]
    Overlap {
        /// Human-readable list of the conflicting pairs.
        conflicts: String,
    },
    /// The stored magic does not match the schema's.
    #[snafu(display("invalid magic 0x{found:08x}, should be 0x{expected:08x}"))]
    MagicMismatch {
        /// Magic actually present.
        found: u32,
        /// Magic the schema declares.
        expected: u32,
    },
    /// The named variable does not exist in this state.
    #[snafu(display("no such variable: {name}"))]
    NoSuchVariable {
        /// The requested name.
        name: String,
    },
    /// Text input did not parse for the variable's type.
    #[snafu(display("invalid value {value:?} for {name}: {reason}"))]
    InvalidValue {
        /// The variable being set.
        name: String,
        /// The rejected input.
        value: String,
        /// Why it was rejected.
        reason: &'static str,
    },
    /// An integer exceeds the variable type's width.
    #[snafu(display("value {value} out of range for {name} (max {max})"))]
    OutOfRange {
        /// The variable being set.
        name: String,
        /// The rejected value.
        value: u64,
        /// Largest accepted value.
        max: u64,
    },
    /// A string is longer than the variable's declared buffer.
    #[snafu(display("string for {name} exceeds {size} bytes"))]
    StringOverflow {
        /// The variable being set.
        name: String,
        /// The declared buffer size.
        size: u32,
    },
    /// A loaded value cannot be rendered (enum index outside its names).
    #[snafu(display("{name} holds a value outside its declared range"))]
    CorruptValue {
        /// The unreadable variable.
        name: String,
    },
    /// The state has no backend attached.
    #[snafu(display("state has no backend"))]
    NoBackend,
    /// The backend's device node is absent from the tree being fixed up.
    #[snafu(display("backend node {path} not present in tree"))]
    FixupTarget {
        /// The missing node path.
        path: String,
    },
}

pub(crate) type Result<T, E = Error> = core::result::Result<T, E>;

/// A skeleton node remembering the schema's shape for later export.
#[derive(Debug, Clone)]
struct SchemaEntry {
    name: String,
    children: Vec<usize>,
    var: Option<String>,
}

/// A named, schema-defined collection of typed variables with a backing
/// store.
#[derive(Debug)]
pub struct State {
    name: String,
    root_name: String,
    root_path: String,
    magic: u32,
    schema: Vec<SchemaEntry>,
    variables: Vec<Variable>,
    backend: Option<Backend>,
    dirty: bool,
}

impl State {
    /// Assemble a state instance from the schema rooted at `node`.
    ///
    /// Walks the children depth-first, creating one variable per `type`
    /// leaf, importing defaults and values, and validating that no two
    /// variables overlap.
    ///
    /// # Errors
    /// Schema errors (missing `magic`/`type`/`reg`, bad sizes), and an
    /// aggregated [`Error::Overlap`] after every conflict has been reported.
    pub fn from_node(tree: &Tree, node: NodeId, name: &str) -> Result<State> {
        let magic = tree.read_u32(node, "magic").context(SchemaSnafu { name })?;
        let mut state = State {
            name: name.into(),
            root_name: tree.name(node).to_string(),
            root_path: tree.path(node).to_string(),
            magic,
            schema: vec![SchemaEntry {
                name: tree.name(node).to_string(),
                children: Vec::new(),
                var: None,
            }],
            variables: Vec::new(),
            backend: None,
            dirty: true,
        };
        for child in tree.children(node) {
            state.walk_create(tree, *child, "", 0)?;
        }
        state.check_overlaps()?;
        Ok(state)
    }

    fn walk_create(
        &mut self,
        tree: &Tree,
        node: NodeId,
        prefix: &str,
        parent_entry: usize,
    ) -> Result<()> {
        let dotted = join_name(prefix, tree.base_name(node));
        let entry = self.schema.len();
        self.schema.push(SchemaEntry {
            name: tree.name(node).to_string(),
            children: Vec::new(),
            var: None,
        });
        self.schema[parent_entry].children.push(entry);

        for child in tree.children(node) {
            self.walk_create(tree, *child, &dotted, entry)?;
        }

        let Some(type_name) = node_type(tree, node, &dotted)? else {
            return Ok(());
        };

        let mut var = Variable::create(type_name, &dotted, tree, node)?;
        let reg = tree
            .read_u32_array(node, "reg", 2)
            .context(SchemaSnafu {
                name: dotted.as_str(),
            })?;
        ensure!(
            reg[1] == var.size,
            SizeMismatchSnafu {
                name: dotted.as_str(),
                type_name,
                expected: var.size,
                actual: reg[1]
            }
        );
        var.start = reg[0];
        var.import(tree, node)?;

        let pos = self
            .variables
            .partition_point(|v| v.start < var.start);
        self.variables.insert(pos, var);
        self.schema[entry].var = Some(dotted);
        Ok(())
    }

    fn check_overlaps(&self) -> Result<()> {
        let mut conflicts = Vec::new();
        for (prev, next) in self.variables.iter().tuple_windows() {
            if prev.start + prev.size > next.start {
                log::error!(
                    "conflicting variable position between: {} (0x{:02x}..0x{:02x}) and {} (0x{:02x}..0x{:02x})",
                    prev.name,
                    prev.start,
                    prev.start + prev.size - 1,
                    next.name,
                    next.start,
                    next.start + next.size - 1,
                );
                conflicts.push(format!("{} and {}", prev.name, next.name));
            }
        }
        ensure!(
            conflicts.is_empty(),
            OverlapSnafu {
                conflicts: conflicts.join(", ")
            }
        );
        Ok(())
    }

    /// Re-import values from another schema tree (a loaded DTB record).
    ///
    /// Variables present in the tree but unknown to this state are skipped;
    /// a non-zero magic mismatch is rejected.
    ///
    /// # Errors
    /// Magic mismatch or ill-formed value properties.
    pub fn import_node(&mut self, tree: &Tree, node: NodeId) -> Result<()> {
        import_tree(tree, node, self.magic, &mut self.variables)
    }

    /// Serialise the state into a fresh tree whose root is the state node.
    #[must_use]
    pub fn to_tree(&self, conv: Convert) -> Tree {
        let mut tree = Tree::new();
        let root = tree.root();
        tree.write_u32(root, "magic", self.magic);
        // the schema skeleton is always internally consistent
        let _ = self.export_children(&mut tree, root, 0, conv);
        tree
    }

    /// Serialise the state as a child of `parent` in an existing tree.
    ///
    /// # Errors
    /// [`Error::NoSuchVariable`] if the schema skeleton references a
    /// variable that has disappeared (never the case for assembled states).
    pub fn to_node(&self, tree: &mut Tree, parent: NodeId, conv: Convert) -> Result<NodeId> {
        let node = tree.add_node(parent, &self.root_name);
        tree.write_u32(node, "magic", self.magic);
        self.export_children(tree, node, 0, conv)?;
        Ok(node)
    }

    fn export_children(
        &self,
        tree: &mut Tree,
        parent_node: NodeId,
        entry: usize,
        conv: Convert,
    ) -> Result<()> {
        for child in self.schema[entry].children.clone() {
            let name = self.schema[child].name.clone();
            let node = tree.add_node(parent_node, &name);
            self.export_children(tree, node, child, conv)?;
            match &self.schema[child].var {
                Some(var_name) => {
                    let var = self
                        .variable(var_name)
                        .context(NoSuchVariableSnafu {
                            name: var_name.as_str(),
                        })?;
                    tree.write_string(node, "type", var.type_name());
                    tree.write_u32_array(node, "reg", &[var.start, var.size]);
                    var.export(tree, node, conv);
                }
                None if conv == Convert::Fixup => {
                    tree.write_u32(node, "#address-cells", 1);
                    tree.write_u32(node, "#size-cells", 1);
                }
                None => {}
            }
        }
        Ok(())
    }

    /// Re-create this state's schema inside a kernel tree, annotated with
    /// the backend binding so a booted system can find its state again.
    ///
    /// Replaces any node already present at the schema's original path.
    ///
    /// # Errors
    /// [`Error::NoBackend`] without a configured backend and
    /// [`Error::FixupTarget`] when the backend's device node is absent.
    pub fn fixup(&self, tree: &mut Tree) -> Result<NodeId> {
        let backend = self.backend.as_ref().context(NoBackendSnafu)?;

        let parent = if let Some(existing) = tree.find_by_path(&self.root_path) {
            let parent = tree.parent(existing).unwrap_or_else(|| tree.root());
            tree.remove_node(existing);
            parent
        } else {
            self.root_path
                .rsplit_once('/')
                .map(|(parent_path, _)| parent_path)
                .filter(|p| !p.is_empty())
                .and_then(|p| tree.find_by_path(p))
                .unwrap_or_else(|| tree.root())
        };

        let node = self.to_node(tree, parent, Convert::Fixup)?;
        tree.write_string(node, "compatible", "barebox,state");
        tree.write_string(node, "backend-type", backend.kind_name());
        let backend_node = tree
            .find_by_path(backend.of_path())
            .context(FixupTargetSnafu {
                path: backend.of_path(),
            })?;
        let phandle = tree.create_phandle(backend_node);
        tree.write_u32(node, "backend", phandle);
        if let Some(algo) = backend.digest_algo() {
            tree.write_string(node, "algo", algo);
        }
        tree.write_u32(node, "#address-cells", 1);
        tree.write_u32(node, "#size-cells", 1);
        Ok(node)
    }

    /// The instance name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The schema's 32-bit magic.
    #[must_use]
    pub fn magic(&self) -> u32 {
        self.magic
    }

    /// Whether unsaved modifications exist.
    #[must_use]
    pub fn dirty(&self) -> bool {
        self.dirty
    }

    /// The variables, ordered by ascending `start`.
    pub fn variables(&self) -> impl Iterator<Item = &Variable> {
        self.variables.iter()
    }

    /// Look up a variable by its dotted name.
    #[must_use]
    pub fn variable(&self, name: &str) -> Option<&Variable> {
        self.variables.iter().find(|v| v.name == name)
    }

    /// Payload length: the end of the last (highest-placed) variable.
    #[must_use]
    pub fn size_data(&self) -> u32 {
        self.variables.last().map_or(0, |v| v.start + v.size)
    }

    /// Attach the backing store.
    pub fn set_backend(&mut self, backend: Backend) {
        self.backend = Some(backend);
    }

    /// The attached backend, if any.
    #[must_use]
    pub fn backend(&self) -> Option<&Backend> {
        self.backend.as_ref()
    }

    /// Format the named variable's current value.
    ///
    /// # Errors
    /// [`Error::NoSuchVariable`] or a formatting failure.
    pub fn get(&self, name: &str) -> Result<String> {
        self.variable(name)
            .context(NoSuchVariableSnafu { name })?
            .get()
    }

    /// Parse and apply a new value, marking the instance dirty.
    ///
    /// # Errors
    /// [`Error::NoSuchVariable`] or the type's parse failure.
    pub fn set(&mut self, name: &str, value: &str) -> Result<()> {
        let var = self
            .variables
            .iter_mut()
            .find(|v| v.name == name)
            .context(NoSuchVariableSnafu { name })?;
        var.set(value)?;
        self.dirty = true;
        Ok(())
    }

    /// Load values from the backing store.
    ///
    /// With `auth` false the HMAC verification step is skipped; all other
    /// integrity checks still apply. On failure the instance stays dirty so
    /// a later save rebuilds the record from defaults.
    ///
    /// # Errors
    /// [`crate::backend::Error`] when every copy failed (raw) or the record
    /// did not decode (dtb).
    pub fn load(&mut self, auth: bool) -> Result<(), crate::backend::Error> {
        let Some(backend) = self.backend.as_mut() else {
            return crate::backend::NoBackendSnafu.fail();
        };
        match backend.load(self.magic, &mut self.variables, auth) {
            Ok(()) => {
                log::info!("{}: load successful", self.name);
                self.dirty = false;
                Ok(())
            }
            Err(err) => {
                self.dirty = true;
                Err(err)
            }
        }
    }

    /// Write the state back to the backing store if it is dirty.
    ///
    /// # Errors
    /// [`crate::backend::Error`] on serialisation or device failures.
    pub fn save(&mut self) -> Result<(), crate::backend::Error> {
        if !self.dirty {
            return Ok(());
        }
        let dtb_tree = match self.backend {
            Some(Backend::Dtb(_)) => Some(self.to_tree(Convert::ToNode)),
            _ => None,
        };
        let Some(backend) = self.backend.as_mut() else {
            return crate::backend::NoBackendSnafu.fail();
        };
        match backend {
            Backend::Raw(raw) => raw.save(self.magic, &self.variables)?,
            Backend::Dtb(dtb) => {
                if let Some(tree) = &dtb_tree {
                    dtb.save(tree)?;
                }
            }
        }
        log::debug!("wrote state {} to {}", self.name, backend.path().display());
        self.dirty = false;
        Ok(())
    }
}

/// Re-import values for `vars` from a schema tree rooted at `node`,
/// rejecting a non-zero magic mismatch. Shared with the DTB backend.
pub(crate) fn import_tree(
    tree: &Tree,
    node: NodeId,
    magic: u32,
    vars: &mut [Variable],
) -> Result<()> {
    let found = tree.read_u32(node, "magic").context(SchemaSnafu {
        name: tree.path(node),
    })?;
    ensure!(
        magic == 0 || found == magic,
        MagicMismatchSnafu {
            found,
            expected: magic
        }
    );
    for child in tree.children(node) {
        walk_import(tree, *child, "", vars)?;
    }
    Ok(())
}

/// Import walk shared with the DTB backend.
pub(crate) fn walk_import(
    tree: &Tree,
    node: NodeId,
    prefix: &str,
    vars: &mut [Variable],
) -> Result<()> {
    let dotted = join_name(prefix, tree.base_name(node));
    for child in tree.children(node) {
        walk_import(tree, *child, &dotted, vars)?;
    }
    let Some(type_name) = node_type(tree, node, &dotted)? else {
        return Ok(());
    };
    let Some(var) = vars.iter_mut().find(|v| v.name == dotted) else {
        log::debug!("no such variable: {dotted}");
        return Ok(());
    };
    ensure!(
        var.type_name() == type_name,
        TypeMismatchSnafu {
            name: dotted.as_str(),
            expected: var.type_name(),
            found: type_name
        }
    );
    var.import(tree, node)
}

/// A leaf must carry `type`; nodes with children may omit it (name prefix).
fn node_type<'t>(tree: &'t Tree, node: NodeId, dotted: &str) -> Result<Option<&'t str>> {
    match tree.read_string(node, "type") {
        Ok(type_name) => Ok(Some(type_name)),
        Err(PropertyError::NotFound { .. }) if !tree.children(node).is_empty() => Ok(None),
        Err(source) => Err(Error::Schema {
            name: dotted.into(),
            source,
        }),
    }
}

fn join_name(prefix: &str, short: &str) -> String {
    if prefix.is_empty() {
        short.to_string()
    } else {
        format!("{prefix}.{short}")
    }
}
