//! The matchmaker keeps the registry of live game-server rooms.
//!
//! Running game containers register themselves and send periodic
//! heartbeats; clients query the active set to discover joinable rooms. A
//! background reaper evicts entries whose heartbeats have lapsed.

#![forbid(unsafe_code)]

pub mod matchmaker;
pub mod server;
pub mod settings;
pub mod store;
