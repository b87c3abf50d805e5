//! Scoring, ranking and reporting of firmware deltas.
//!
//! - [`protection`]: permission protection-level scores, permission and GID digests
//! - [`components`]: package component guards and export state
//! - [`broadcasts`]: filtered broadcast actions nobody declared protected
//! - [`priority`]: review order of binary and package digests
//! - [`report`]: the combined [`DigestReport`](report::DigestReport)

pub mod broadcasts;
pub mod components;
pub mod priority;
pub mod protection;
pub mod report;
