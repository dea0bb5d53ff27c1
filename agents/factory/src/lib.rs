//! The factory turns uploaded game programs into supervised containers.
//!
//! Uploads are validated and statically analyzed, materialized into a
//! Docker build context, built and launched; a background supervisor
//! watches every container for idleness, errors and resource usage, and
//! the instance registry projects the current fleet over HTTP.

#![forbid(unsafe_code)]

pub mod analyze;
pub mod build;
pub mod factory;
pub mod registry;
pub mod server;
pub mod settings;
pub mod supervisor;
pub mod validate;
