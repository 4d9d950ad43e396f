//! Wire Protocol Module
//!
//! Every socket exchange in the cluster (client <-> coordinator, coordinator <-> storage
//! node, storage node <-> storage node) uses the same explicitly typed framing.
//!
//! ## Framing
//! - **Strings**: 2-byte big-endian length prefix followed by UTF-8 bytes.
//! - **Longs / Ints**: 8-byte / 4-byte big-endian signed integers.
//! - **Payloads**: a raw byte stream whose length was declared by a preceding long.
//!
//! There is no message envelope beyond "read exactly as many bytes as were declared".
//! UDP discovery datagrams carry a single framed string.

pub mod codec;
pub mod commands;
