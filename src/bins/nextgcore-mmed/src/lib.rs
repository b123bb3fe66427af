//! NextGCore MME control-plane core
//!
//! eNB association registry, UE connection state machine, EPS bearer pools
//! with TFT editing, handover and path switch coordination, and the timer
//! index that ties expiries back to their UE.

pub mod association;
pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod event;
pub mod mobility;
pub mod s1ap_build;
pub mod s1ap_handler;
pub mod session;
pub mod sm;
pub mod tft;
pub mod timer;

pub use config::{ConfigFile, MmeConfig};
pub use context::MmeContext;
pub use error::{MmeError, MmeResult};
pub use event::{AppIndication, AppRequest, MmeEvent, Outbox, S1apInbound};
pub use sm::{Fsm, MmeFsm, MmeState};

#[cfg(test)]
mod property_tests;
