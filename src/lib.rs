//! One-to-many publish/subscribe IPC over named pipes.
//!
//! A server publishes an *endpoint*: a filesystem directory holding a JSON
//! descriptor, a rendezvous FIFO, an optional control FIFO, and one data FIFO
//! per attached client. Clients rendezvous by writing their desired handle
//! into the `request` FIFO; the server answers by creating a data FIFO named
//! after that handle and fanning records out to it.
//!
//! Every client owns an isolated kernel buffer, and fan-out writes are
//! non-blocking and capacity-checked: a backed-up client loses its own
//! records while its peers keep receiving everything. There is no delivery
//! guarantee, no ordering between distinct clients, and no security; this is
//! a trust-all fabric for processes sharing one host.
//!
//! The [`server`] and [`client`] modules hold the two connection engines, and
//! each manages a bounded table of [`MAX_CHANNELS`] channels addressed by
//! index so that unrelated streams in one process stay independent.
//! [`endpoint`] covers descriptor and path handling, [`frames`] the record
//! framing (including H264/H265 frame sequencing), and [`process`] the
//! process-lifecycle helpers servers typically want alongside.

#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

pub mod client;
pub mod endpoint;
pub mod frames;
pub mod process;
pub mod server;

mod errors;
mod sys;

pub use crate::client::ClientFlags;
pub use crate::endpoint::{
    EndpointInfo, DEFAULT_BASE_DIR, DEFAULT_PIPE_SIZE, MAX_DIR_LEN, MAX_NAME_LEN,
};
pub use crate::errors::{PipeError, Result};
pub use crate::frames::{
    CameraMeta, EncodedFrameKind, PointCloudFormat, PointCloudMeta, RECORD_MAGIC,
};
pub use crate::server::ServerFlags;

/// Server channels (and client slots) available per process.
pub const MAX_CHANNELS: usize = 16;
