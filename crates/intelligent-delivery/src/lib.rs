//! Intelligent delivery: send-window scheduling with jitter and pacing of
//! sends within a dispatch tick.

pub mod pacing;
pub mod send_window;

pub use pacing::SendPacer;
pub use send_window::SendWindow;
