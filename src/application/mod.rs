//! Application services of the endorsement core.
//!
//! Each service owns one stage of the lifecycle and talks to the others
//! only through the event log. `Pipeline` binds them to consumer groups.

pub mod gateway;
pub mod hold_release;
pub mod intake;
pub mod ledger;
pub mod orchestrator;
pub mod pipeline;
pub mod retry;
pub mod scheduler;
pub mod validation;
