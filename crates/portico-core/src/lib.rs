//! # portico-core
//!
//! Shared vocabulary for the Portico WebSocket server.
//!
//! - **Session ids**: [`SessionId`], an opaque, time-ordered identifier
//! - **Lifecycle states**: [`ServerState`] for servers and registries,
//!   [`ConnectionState`] for individual sessions
//! - **Frame vocabulary**: [`Opcode`] and [`CompressionMethod`]
//! - **Close frames**: [`CloseCode`] and the validated [`CloseFrame`] codec
//! - **Logging**: [`logging::init_subscriber`] for binaries and tests

#![deny(unsafe_code)]

pub mod close;
pub mod errors;
pub mod ids;
pub mod logging;
pub mod opcode;
pub mod state;

pub use close::{CloseCode, CloseFrame, MAX_REASON_BYTES};
pub use errors::CloseFrameError;
pub use ids::SessionId;
pub use opcode::{CompressionMethod, Opcode};
pub use state::{ConnectionState, ServerState};
