//! Cooperative pause/resume/abort control between a control plane and the
//! sampling worker.
//!
//! Each run owns one [`ControlChannel`]. The control plane writes the latest
//! command, the worker reads it at every step boundary. There is no queue:
//! the last write wins.

mod channel;
mod command;
mod registry;
mod steer;

pub use channel::{ControlChannel, DEFAULT_POLL_INTERVAL};
pub use command::ControlCommand;
pub use registry::ControlRegistry;
pub use steer::{handle_steer, SteerRequest, SteerResponse};
