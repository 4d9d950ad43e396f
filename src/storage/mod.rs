//! Storage Node Module
//!
//! A storage node owns a directory of parts and serves them over TCP, one command
//! per connection.
//!
//! ## Core Concepts
//! - **Parts**: `PartStore` keeps each part as a file named after the part; a part is
//!   only visible once fully written.
//! - **Commands**: `store`, `GET_PART` and `DELETE_PART`, handled by `StorageNode`.
//! - **Replication**: every newly stored part is pushed once to a peer picked by a
//!   `ReplicaPolicy`, and the coordinator is told where the copy lives.
//! - **Client**: `StorageClient` is the other side of the protocol, used by the
//!   coordinator and by replication.

pub mod client;
pub mod part_store;
pub mod replication;
pub mod server;

#[cfg(test)]
mod tests;
