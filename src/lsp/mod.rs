//! Language Server Protocol plumbing
//!
//! Layered bottom-up: [`framing`] adds `Content-Length` headers to a raw
//! transport, [`protocol`] speaks JSON-RPC over it, and [`client`] exposes
//! the typed LSP operations.

pub mod client;
pub mod framing;
pub mod jsonrpc_utils;
pub mod protocol;

pub use client::{LspClient, LspError, to_lsp_uri};
pub use framing::{LspFraming, LspFramingError};
pub use protocol::{JsonRpcClient, JsonRpcError};
