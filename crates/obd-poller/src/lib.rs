//! OBD-II Live-Data Poller
//!
//! Polls the subscribed PIDs of the selected ECU in a background task while
//! the controller changes subscriptions through a command queue.

mod error;
mod poller;
mod session;
mod subscription;

pub use error::SessionError;
pub use poller::{LivePoller, PollerCommand, PollerConfig, PollerHandle};
pub use session::Session;
pub use subscription::Subscriptions;
