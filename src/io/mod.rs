//! I/O layer - framing, transport and process management
//!
//! This module knows nothing about request correlation:
//!
//! - **Framing**: one JSON message per `\n`-terminated line
//! - **Transport**: background-read, queued message exchange over a byte stream
//! - **Process**: an agent subprocess wired to a transport

pub mod framing;
pub mod process;
pub mod transport;

// Re-export main types for convenience
pub use framing::{FramingError, NdjsonCodec};
pub use process::{ProcessConfig, ProcessError, ProcessState, ProcessTransport, StderrSink};
pub use transport::{StdioTransport, Transport, TransportError};
