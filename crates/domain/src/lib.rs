//! Shared domain types for the Foreman agent runtime.
//!
//! Everything that crosses a crate boundary lives here: conversation
//! messages, tool calls, agent events, claims, outcomes, run records,
//! and the shared error type.

pub mod cancel;
pub mod claim;
pub mod config;
pub mod error;
pub mod event;
pub mod llm;
pub mod message;
pub mod outcome;
pub mod run;

pub use error::{Error, Result};
