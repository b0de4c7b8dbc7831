//! Change-detection agent, one per page context.
//!
//! Watches the page-scoped store through every available trigger, funnels
//! the triggers through one [`CheckScheduler`], and pushes observable
//! credential changes to the central process.

pub mod agent;
pub mod scheduler;
pub mod state;

pub use agent::{AgentHandle, ChangeDetectionAgent};
pub use scheduler::{CheckScheduler, CheckSource, DueCheck, TriggerPolicy};
pub use state::{CheckDecision, SyncAgentState};
