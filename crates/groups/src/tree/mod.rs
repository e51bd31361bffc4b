//! The resource group tree -- hierarchical admission control and scheduling.
//!
//! Split into focused submodules:
//! - `state`: arena of groups, query records and counter bookkeeping
//! - `core`: the `ResourceGroup` handle, sub group creation and configuration
//! - `admission`: submission, completion and capacity checks
//! - `scheduling`: eligibility tracking and queued query promotion
//! - `stats`: CPU charging, quota regeneration and memory kill enforcement
//! - `snapshot`: group and query snapshots

mod admission;
mod core;
mod scheduling;
mod snapshot;
mod state;
mod stats;
#[cfg(test)]
mod tests;

pub use self::admission::QueryAdmission;
pub use self::core::ResourceGroup;
