//! PostgreSQL frontend/backend protocol codec.
//!
//! This module defines the typed messages exchanged between a PostgreSQL client (the
//! "frontend") and server (the "backend"), together with the framing logic needed to
//! write them to and read them from a byte stream. It is the layer stories are replayed
//! through; it knows nothing about stories itself.
//!
//! # Overview
//!
//! Frontend messages are the ones a story sends ([`FrontendMessage`]); backend messages
//! are the ones it expects back ([`BackendMessage`]). Each backend message reports its
//! protocol-level [`MessageKind`], which maps one-to-one to the message's wire type tag.
//!
//! # Binary Format
//!
//! Protocol messages use the version 3.0 framing:
//!
//! - One type tag byte (absent for the startup message).
//! - A big-endian `i32` length that counts itself and the body, but not the tag.
//! - The body, encoded according to message-specific rules.
//!
//! # Key Components
//!
//! - [`FrontendMessage`] / [`BackendMessage`]: message values with `encode`/`decode`.
//! - [`ProtocolTransport`]: framed reader/writer over any `Read + Write` stream.
//! - [`Duplex`]: a stream that can be split into a reader and a writer handle.
//!
//! # See Also
//!
//! - [`story`](crate::story): Scripts that are replayed through this codec.
mod backend;
mod frontend;
mod transport;
mod wire;

pub use backend::{
    BackendMessage, ErrorFields, FIELD_CODE, FIELD_MESSAGE, FIELD_SEVERITY, FieldDescription,
    MessageKind,
};
pub use frontend::{FrontendMessage, ObjectType, PROTOCOL_VERSION};
pub use transport::{Duplex, ProtocolTransport, TransportError};
pub use wire::{DecodeError, EncodeError};
