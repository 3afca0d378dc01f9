//! Core of a GPU debugger extension: coordinates and iterators over the
//! device's physical (device/SM/warp/lane) and logical (kernel/block/thread)
//! hierarchies, a lazily populated mirror of the hardware state, an event
//! processor for the debug API's notifications, and the cross-thread
//! signaling machinery that wakes the host debugger out of its wait loop.
//!
//! The surrounding debugger plugs in below through [`api::DebugApi`] and
//! above through [`host::HostDebugger`].

pub mod api;
pub mod commands;
pub mod contexts;
pub mod coords;
pub mod events;
pub mod host;
pub mod iterator;
pub mod kernels;
pub mod notifications;
pub mod options;
pub mod parser;
pub mod state;
pub mod testing;

pub use api::{ApiError, AttachState, DebugApi};
pub use coords::{Coords, Dim3};
pub use options::Options;
pub use state::System;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    Parse(String),
    #[error("incomplete coordinates: {0} not fully defined")]
    Incomplete(&'static str),
    #[error("focus not set on any active kernel")]
    NoCurrentFocus,
    #[error("{0} not found")]
    NotFound(String),
    #[error("an event reported an invalid thread id")]
    InvalidThreadId,
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("internal error reported by the debug API (error={0}): the application cannot be further debugged")]
    Internal(u32),
    #[error("request cannot be satisfied")]
    Unsatisfiable,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
