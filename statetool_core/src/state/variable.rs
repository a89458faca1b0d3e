//! Typed state variables.
//!
//! Each variable couples a schema position (`start`/`size` from the `reg`
//! property) with a typed value. The on-medium image of a value is
//! little-endian; the schema side (device tree properties) stays big-endian.

use byteorder::{ByteOrder, LittleEndian};
use snafu::{ensure, OptionExt, ResultExt};

use super::{
    CorruptValueSnafu, Error, InvalidValueSnafu, OutOfRangeSnafu, Result, SchemaSnafu,
    StringOverflowSnafu, UnknownTypeSnafu,
};
use crate::device_tree::{NodeId, PropertyError, Tree};

/// Upper bound on string variable storage.
pub const STRING_MAX_SIZE: u32 = 4096;

/// Conversion directions between schema nodes and variables.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Convert {
    /// Read `value`/`default` properties into existing variables.
    FromNode,
    /// Build variables while reading (initial assembly).
    FromNodeCreate,
    /// Serialise variables into a fresh sub-tree.
    ToNode,
    /// Like `ToNode`, but defaults only; used to annotate a kernel tree.
    Fixup,
}

/// The typed payload of a variable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VariableKind {
    /// One byte, stored as the low byte of a 32-bit cell.
    Uint8 {
        /// Current value (only the low byte reaches the medium).
        value: u32,
        /// Schema default.
        default: u32,
    },
    /// Four bytes, little-endian.
    Uint32 {
        /// Current value.
        value: u32,
        /// Schema default.
        default: u32,
    },
    /// Four bytes interpreted as an index into a name list.
    Enum32 {
        /// Current index.
        value: u32,
        /// Schema default index.
        default: u32,
        /// Orderered name list, read once from the schema.
        names: Vec<String>,
    },
    /// Six raw bytes.
    Mac {
        /// Current address.
        value: [u8; 6],
        /// Schema default.
        default: [u8; 6],
    },
    /// Fixed-size NUL-padded buffer.
    String {
        /// Raw buffer, exactly `size` bytes.
        raw: Vec<u8>,
        /// Schema default, if any.
        default: Option<String>,
    },
}

/// One typed field of a state instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Variable {
    /// Fully qualified, dot-joined name.
    pub name: String,
    /// Byte offset within the payload.
    pub start: u32,
    /// Byte length within the payload.
    pub size: u32,
    /// The typed value.
    pub kind: VariableKind,
}

impl Variable {
    /// Create a variable of the named type from its schema node.
    ///
    /// `size` is the type's fixed width, except for strings where the `reg`
    /// size is authoritative (capped at [`STRING_MAX_SIZE`]).
    ///
    /// # Errors
    /// Unknown type names, missing/ill-formed schema properties.
    pub fn create(type_name: &str, name: &str, tree: &Tree, node: NodeId) -> Result<Variable> {
        let kind = match type_name {
            "uint8" => VariableKind::Uint8 {
                value: 0,
                default: 0,
            },
            "uint32" => VariableKind::Uint32 {
                value: 0,
                default: 0,
            },
            "enum32" => {
                let count = tree.count_strings(node, "names").context(SchemaSnafu { name })?;
                let names = (0..count)
                    .map(|i| {
                        tree.read_string_index(node, "names", i)
                            .map(str::to_owned)
                    })
                    .collect::<core::result::Result<Vec<_>, _>>()
                    .context(SchemaSnafu { name })?;
                VariableKind::Enum32 {
                    value: 0,
                    default: 0,
                    names,
                }
            }
            "mac" => VariableKind::Mac {
                value: [0; 6],
                default: [0; 6],
            },
            "string" => {
                let reg = tree
                    .read_u32_array(node, "reg", 2)
                    .context(SchemaSnafu { name })?;
                ensure!(
                    reg[1] <= STRING_MAX_SIZE,
                    StringOverflowSnafu {
                        name,
                        size: STRING_MAX_SIZE
                    }
                );
                VariableKind::String {
                    raw: vec![0; reg[1] as usize],
                    default: None,
                }
            }
            other => return UnknownTypeSnafu { name: other }.fail(),
        };
        let size = match &kind {
            VariableKind::Uint8 { .. } => 1,
            VariableKind::Uint32 { .. } | VariableKind::Enum32 { .. } => 4,
            VariableKind::Mac { .. } => 6,
            VariableKind::String { raw, .. } => raw.len() as u32,
        };
        log::debug!("create {type_name} variable {name}");
        Ok(Variable {
            name: name.into(),
            start: 0,
            size,
            kind,
        })
    }

    /// The schema name of the variable's type.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self.kind {
            VariableKind::Uint8 { .. } => "uint8",
            VariableKind::Uint32 { .. } => "uint32",
            VariableKind::Enum32 { .. } => "enum32",
            VariableKind::Mac { .. } => "mac",
            VariableKind::String { .. } => "string",
        }
    }

    /// Read `value` and `default` properties from a schema node.
    ///
    /// A missing `value` falls back to `default`; a missing `default` leaves
    /// the zero default in place.
    ///
    /// # Errors
    /// Present-but-ill-sized properties are invalid.
    pub fn import(&mut self, tree: &Tree, node: NodeId) -> Result<()> {
        match &mut self.kind {
            VariableKind::Uint8 { value, default }
            | VariableKind::Uint32 { value, default }
            | VariableKind::Enum32 { value, default, .. } => {
                if let Some(d) = opt_prop(self.name.as_str(), tree.read_u32(node, "default"))? {
                    *default = d;
                }
                *value = match opt_prop(self.name.as_str(), tree.read_u32(node, "value"))? {
                    Some(v) => v,
                    None => *default,
                };
            }
            VariableKind::Mac { value, default } => {
                if let Some(d) = opt_prop(self.name.as_str(), tree.read_u8_array(node, "default", 6))? {
                    default.copy_from_slice(&d);
                }
                match opt_prop(self.name.as_str(), tree.read_u8_array(node, "value", 6))? {
                    Some(v) => value.copy_from_slice(&v),
                    None => *value = *default,
                }
            }
            VariableKind::String { raw, default } => {
                let size = raw.len();
                if let Some(d) = opt_prop(self.name.as_str(), tree.read_string(node, "default"))? {
                    ensure!(
                        d.len() <= size,
                        StringOverflowSnafu {
                            name: self.name.as_str(),
                            size: size as u32
                        }
                    );
                    *default = Some(d.to_owned());
                }
                let text = match opt_prop(self.name.as_str(), tree.read_string(node, "value"))? {
                    Some(v) => Some(v.to_owned()),
                    None => default.clone(),
                };
                if let Some(text) = text {
                    copy_to_raw(self.name.as_str(), raw, &text)?;
                }
            }
        }
        Ok(())
    }

    /// Write `default`/`value` (and `names` for enums) onto a schema node.
    ///
    /// In [`Convert::Fixup`] mode only the default is emitted.
    pub fn export(&self, tree: &mut Tree, node: NodeId, conv: Convert) {
        let fixup = conv == Convert::Fixup;
        match &self.kind {
            VariableKind::Uint8 { value, default }
            | VariableKind::Uint32 { value, default } => {
                if *default != 0 || fixup {
                    tree.write_u32(node, "default", *default);
                }
                if !fixup {
                    tree.write_u32(node, "value", *value);
                }
            }
            VariableKind::Enum32 {
                value,
                default,
                names,
            } => {
                if *default != 0 || fixup {
                    tree.write_u32(node, "default", *default);
                }
                if !fixup {
                    tree.write_u32(node, "value", *value);
                    tree.write_string_list(node, "names", names);
                }
            }
            VariableKind::Mac { value, default } => {
                tree.write_u8_array(node, "default", default);
                if !fixup {
                    tree.write_u8_array(node, "value", value);
                }
            }
            VariableKind::String { raw, default } => {
                if let Some(default) = default {
                    tree.write_string(node, "default", default);
                } else if fixup {
                    return;
                }
                if !fixup {
                    tree.write_string(node, "value", &raw_to_string(raw));
                }
            }
        }
    }

    /// Copy the variable's raw image into `dst`, which must be exactly
    /// `size` bytes.
    pub fn store_raw(&self, dst: &mut [u8]) {
        debug_assert_eq!(dst.len(), self.size as usize);
        match &self.kind {
            VariableKind::Uint8 { value, .. } => dst[0] = value.to_le_bytes()[0],
            VariableKind::Uint32 { value, .. } | VariableKind::Enum32 { value, .. } => {
                LittleEndian::write_u32(dst, *value);
            }
            VariableKind::Mac { value, .. } => dst.copy_from_slice(value),
            VariableKind::String { raw, .. } => dst.copy_from_slice(raw),
        }
    }

    /// Replace the variable's value from its raw image in `src`, which must
    /// be exactly `size` bytes.
    pub fn load_raw(&mut self, src: &[u8]) {
        debug_assert_eq!(src.len(), self.size as usize);
        match &mut self.kind {
            VariableKind::Uint8 { value, .. } => *value = u32::from(src[0]),
            VariableKind::Uint32 { value, .. } | VariableKind::Enum32 { value, .. } => {
                *value = LittleEndian::read_u32(src);
            }
            VariableKind::Mac { value, .. } => value.copy_from_slice(src),
            VariableKind::String { raw, .. } => raw.copy_from_slice(src),
        }
    }

    /// Format the current value as text.
    ///
    /// # Errors
    /// [`Error::CorruptValue`] when an enum index points outside its name
    /// list (possible after loading a damaged payload without checksums).
    pub fn get(&self) -> Result<String> {
        match &self.kind {
            VariableKind::Uint8 { value, .. } | VariableKind::Uint32 { value, .. } => {
                Ok(format!("{value}"))
            }
            VariableKind::Enum32 { value, names, .. } => names
                .get(*value as usize)
                .cloned()
                .context(CorruptValueSnafu { name: self.name.as_str() }),
            VariableKind::Mac { value, .. } => Ok(format!(
                "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
                value[0], value[1], value[2], value[3], value[4], value[5]
            )),
            VariableKind::String { raw, .. } => Ok(raw_to_string(raw)),
        }
    }

    /// Parse `text` and replace the current value.
    ///
    /// # Errors
    /// Malformed input, unknown enum names, out-of-range integers, oversized
    /// strings.
    pub fn set(&mut self, text: &str) -> Result<()> {
        match &mut self.kind {
            VariableKind::Uint8 { value, .. } => {
                let parsed = parse_u32(self.name.as_str(), text)?;
                ensure!(
                    parsed <= u32::from(u8::MAX),
                    OutOfRangeSnafu {
                        name: self.name.as_str(),
                        value: u64::from(parsed),
                        max: u64::from(u8::MAX)
                    }
                );
                *value = parsed;
            }
            VariableKind::Uint32 { value, .. } => *value = parse_u32(self.name.as_str(), text)?,
            VariableKind::Enum32 { value, names, .. } => {
                *value = names
                    .iter()
                    .position(|n| n == text)
                    .context(InvalidValueSnafu {
                        name: self.name.as_str(),
                        value: text,
                        reason: "not one of the declared names",
                    })? as u32;
            }
            VariableKind::Mac { value, .. } => *value = parse_mac(self.name.as_str(), text)?,
            VariableKind::String { raw, .. } => copy_to_raw(self.name.as_str(), raw, text)?,
        }
        Ok(())
    }

    /// Extra detail for verbose dumps (the value list for enums).
    #[must_use]
    pub fn info(&self) -> Option<String> {
        match &self.kind {
            VariableKind::Enum32 { names, .. } => Some(format!("values=[{}]", names.join(","))),
            _ => None,
        }
    }
}

/// Treat a missing property as `None`, any other failure as a schema error.
fn opt_prop<T>(
    name: &str,
    read: core::result::Result<T, PropertyError>,
) -> Result<Option<T>> {
    match read {
        Ok(value) => Ok(Some(value)),
        Err(PropertyError::NotFound { .. }) => Ok(None),
        Err(source) => Err(Error::Schema {
            name: name.into(),
            source,
        }),
    }
}

fn parse_u32(name: &str, text: &str) -> Result<u32> {
    let text = text.trim();
    let parsed = if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else {
        text.parse()
    };
    parsed.ok().context(InvalidValueSnafu {
        name,
        value: text,
        reason: "not a decimal or 0x-prefixed integer",
    })
}

fn parse_mac(name: &str, text: &str) -> Result<[u8; 6]> {
    let invalid = |reason| InvalidValueSnafu {
        name,
        value: text,
        reason,
    };
    ensure!(text.len() == 17, invalid("MAC must be 17 characters"));
    let bytes = text.as_bytes();
    ensure!(
        [2, 5, 8, 11, 14].iter().all(|i| bytes[*i] == b':'),
        invalid("MAC octets must be colon-separated")
    );
    let mut mac = [0u8; 6];
    for (i, octet) in mac.iter_mut().enumerate() {
        *octet = u8::from_str_radix(&text[i * 3..i * 3 + 2], 16)
            .ok()
            .context(invalid("MAC octets must be hex"))?;
    }
    Ok(mac)
}

fn copy_to_raw(name: &str, raw: &mut [u8], text: &str) -> Result<()> {
    ensure!(
        text.len() <= raw.len(),
        StringOverflowSnafu {
            name,
            size: raw.len() as u32
        }
    );
    raw[..text.len()].copy_from_slice(text.as_bytes());
    raw[text.len()..].fill(0);
    Ok(())
}

/// NUL-trimmed view of a string buffer; all-zero buffers read as empty.
fn raw_to_string(raw: &[u8]) -> String {
    if raw.first() == Some(&0) {
        return String::new();
    }
    let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}
