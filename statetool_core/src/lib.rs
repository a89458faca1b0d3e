//! Durable, typed, redundantly stored configuration state.
//!
//! A state instance is a small, schema-defined collection of named
//! variables (counters, flags, MAC addresses, short strings) that survives
//! reboots and power loss. The schema lives in the device tree; the values
//! live on raw flash as CRC- and optionally HMAC-protected redundant
//! records, or as a flattened device tree blob in a file.
//!
//! The usual flow: load the kernel's device tree
//! ([`device_tree::sysfs::load_system_tree`]), locate the state node,
//! assemble a [`state::State`], attach the backend the schema names
//! ([`backend::Backend::from_schema`]), then load, read, mutate, and save.
#![deny(missing_docs)]

pub mod backend;
pub mod device_tree;
pub mod devpath;
pub mod digest;
pub mod state;
pub mod storage;
