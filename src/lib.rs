//! runfs: a FUSE filesystem whose entries vanish once the process that
//! created them is no longer alive.
//!
//! Module layout follows the dependency order of the four core
//! components — Process Probe, Inode Record, Deferred Removal Engine,
//! Filesystem Handler Set — plus the VFS tree glue `fuser` requires and
//! doesn't supply itself, the `fuser` trait adapter, shared error types,
//! and CLI configuration.

pub mod config;
pub mod dre;
pub mod error;
pub mod fs;
pub mod fuse_adapter;
pub mod inode;
pub mod probe;
pub mod tree;
