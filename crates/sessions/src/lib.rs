//! Session management: the session store, per-session event logs, and
//! turn assembly from agent events.

pub mod event_log;
pub mod store;
pub mod turns;

pub use event_log::{EventLog, LoggedEvent};
pub use store::{SessionEntry, SessionStore};
pub use turns::{Turn, TurnAssembler, TurnStatus, TurnStep, TurnType};
