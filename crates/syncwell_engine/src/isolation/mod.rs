//! Error capture, containment and recovery.
//!
//! Failures raised while syncing are classified by [`classify_message`] or
//! by their [`SyncError`](crate::SyncError) variant, stored as
//! [`ErrorRecord`](syncwell_protocol::ErrorRecord)s, contained according to
//! their severity, and recovered through a [`RecoveryStrategy`].

mod classify;
mod filter;
mod isolator;
mod recovery;
mod services;

pub use classify::classify_message;
pub use filter::ErrorFilter;
pub use isolator::ErrorIsolator;
pub use recovery::{
    run_strategy, RecoveryAction, RecoveryExecutor, RecoveryReport, RecoveryStep,
    RecoveryStrategy, StepOutcome,
};
pub use services::{BackgroundService, FlagService, ServiceRegistry};
