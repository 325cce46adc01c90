//! I/O layer: server process management and the stdio transport
//!
//! Protocol-agnostic; the `lsp` module layers framing and JSON-RPC on top.

pub mod process;
pub mod transport;

pub use process::{
    ProcessError, ProcessExitEvent, ProcessExitHandler, ProcessManager, ProcessState,
    ServerProcess, StopMode,
};
pub use transport::{StdioTransport, StdioTransportError, Transport};
