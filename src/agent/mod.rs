//! Message-to-agent orchestration.
//!
//! The dispatcher owns everything between an inbound chat message and
//! the agent's output leaving through a channel: authorization, rate
//! limiting, control commands, session continuation and delivery.

mod dispatcher;
mod session;

pub use dispatcher::{ControlCommand, DeliveryError, Dispatcher};
pub use session::SessionStore;
