//! Tor daemon interaction
//!
//! Handles Tor ControlPort communication: the request/reply channel,
//! asynchronous event parsing and the observers those events are routed to.
//! Tor itself is treated as a black box.

pub mod circuit;
pub mod control;
pub mod events;
pub mod observers;

pub use circuit::{Circuit, CircuitNode};
pub use control::{ControlConnector, ControlState, TcpConnector, TorController};
pub use events::{ControlEvent, EventKind};
pub use observers::{ObserverAction, ObserverToken};
