//! Coordinator Module
//!
//! The primary node clients talk to. It never stores file content itself: it cuts
//! uploads into parts, scatters them over the discovered storage nodes and puts
//! files back together on download.
//!
//! ## Core Concepts
//! - **Splitting**: one part per started MiB, capped by the number of known nodes;
//!   part *i* goes to node *i* of the node list.
//! - **Mapping**: `MappingIndex` durably records the primary location of every part.
//! - **Replicas**: `ReplicationRegistry` remembers the copies storage nodes report,
//!   and downloads fall back to them when a primary cannot deliver.
//! - **Deletes**: removing a file drops its mapping lines and asks every holder of
//!   each part to delete it.
//! - **File locks**: upload, download and delete of one file name never overlap,
//!   so the index never holds two versions of a file.

pub mod handlers;
pub mod locks;
pub mod mapping;
pub mod replicas;
pub mod server;
pub mod splitter;
pub mod types;
