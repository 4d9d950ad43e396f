//! Discovery Module
//!
//! Lets the coordinator learn which storage nodes exist, without any static cluster
//! configuration.
//!
//! ## Protocol
//! - **Probe**: the coordinator periodically broadcasts a `REQUEST_INFO` datagram to a
//!   small range of UDP ports.
//! - **Answer**: each storage node replies by unicast to the prober, on the
//!   coordinator's response port, with its own `host:port`.
//! - **Record**: new answers are appended to the persisted node list; duplicates are
//!   no-ops. Nodes are never evicted automatically.

pub mod node_list;
pub mod responder;
pub mod service;
pub mod types;
