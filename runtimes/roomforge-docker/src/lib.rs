//! Docker-backed [`ContainerRuntime`] implementation.
//!
//! Wraps a bollard client: images are built from an in-memory tar context,
//! containers run with port mapping, environment, labels, a dedicated
//! bridge network and an `unless-stopped` restart policy, and teardown
//! finds factory resources through the managed-by label.

#![forbid(unsafe_code)]

mod runtime;
pub use runtime::*;
