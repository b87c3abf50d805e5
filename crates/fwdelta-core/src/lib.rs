//! Core types, configuration, and error handling for fwdelta.
//!
//! This crate provides the shared foundation used by all other fwdelta crates:
//! - [`FwdeltaError`]: unified error type using `thiserror`
//! - [`FwdeltaConfig`]: configuration loaded from `.fwdelta.toml`
//! - Shared types: [`ChangeRecord`], [`ChangeKind`], [`LineCount`], [`Tier`],
//!   [`OutputFormat`]

mod config;
mod error;
mod types;

pub use config::{
    AnalysisConfig, FwdeltaConfig, ProtectionWeights, TierConfig, ToolConfig,
};
pub use error::FwdeltaError;
pub use types::{ChangeKind, ChangeRecord, LineCount, OutputFormat, Tier, NULL_DEVICE};

/// A convenience `Result` type for fwdelta operations.
pub type Result<T> = std::result::Result<T, FwdeltaError>;
