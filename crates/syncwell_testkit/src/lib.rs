//! # Syncwell Testkit
//!
//! Test utilities for Syncwell.
//!
//! This crate provides:
//! - [`TestEngine`], an offline manager wired to in-memory collaborators
//!   over an in-memory or temporary on-disk store
//! - [`ScriptedRemote`], a remote backend with per-entity failure scripts
//!   and a call log
//! - [`Ledger`], a record of what was submitted, for no-data-loss checks
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use syncwell_testkit::prelude::*;
//!
//! #[tokio::test(start_paused = true)]
//! async fn queued_edit_reaches_remote() {
//!     let engine = TestEngine::memory();
//!     engine.manager.execute(card("c1", "front")).unwrap();
//!     engine.manager.set_online(true);
//!     engine.manager.flush().await.unwrap();
//!     assert!(engine.remote.get("card", "c1").is_some());
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod integration;
pub mod remote;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::integration::*;
    pub use crate::remote::*;
}

pub use fixtures::*;
pub use generators::*;
pub use integration::*;
pub use remote::*;
