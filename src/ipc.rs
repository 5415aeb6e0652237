//! Socket plumbing for the remoting bridge.
//!
//! The host talks to this process over two sockets:
//!
//! ```text
//! ┌────────────┐   control socket (JSON-RPC 2.0)   ┌────────────────────┐
//! │ Nexus host │ ◄───────────────────────────────► │ RemoteCommunicator │
//! │            │   data socket (raw sample bytes)  │   (this crate)     │
//! │            │ ◄───────────────────────────────► │                    │
//! └────────────┘                                   └────────────────────┘
//! ```
//!
//! # Protocol
//!
//! Control messages and nested data replies use a 4-byte big-endian length
//! prefix:
//!
//! ```text
//! 00 00 00 3d {"jsonrpc":"2.0","id":1,"method":"getApiVersion","params":[]}
//! ```
//!
//! The final buffers of a `readSingle` call are written to the data socket
//! without any prefix.

mod framing;
mod writer;

pub use framing::{read_frame, read_size, write_frame, MAX_FRAME_SIZE, PREFIX_SIZE};
pub use writer::{BoxedWriter, ChannelWriter};

/// Type-erased socket read half.
pub type BoxedReader = Box<dyn tokio::io::AsyncRead + Unpin + Send>;
