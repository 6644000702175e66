//! Utility functions
//!
//! Timers and small helpers shared by the supervisor pieces.

pub mod timer;
