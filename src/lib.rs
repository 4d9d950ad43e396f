//! Distributed File Storage Library
//!
//! This library crate defines the modules of a small distributed file store. It
//! serves as the foundation for the binary executable (`main.rs`), which runs
//! either role or acts as a command-line client.
//!
//! ## Architecture Modules
//! - **`protocol`**: Length-prefixed framing shared by every TCP and UDP exchange,
//!   plus the command and reply vocabulary.
//! - **`discovery`**: UDP probing by which the coordinator learns storage node
//!   addresses, and the persisted list of known nodes.
//! - **`storage`**: The storage node. Keeps parts on disk, serves and deletes them,
//!   and replicates each new part to one peer.
//! - **`coordinator`**: The primary node. Splits uploads into parts, records their
//!   locations and reassembles files, falling back to replicas.
//! - **`client`**: Client side of the coordinator protocol.
//! - **`config`**: Typed configuration for both roles.

pub mod client;
pub mod config;
pub mod coordinator;
pub mod discovery;
pub mod protocol;
pub mod storage;
