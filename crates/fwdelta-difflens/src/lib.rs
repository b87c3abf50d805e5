//! Diff-summary parsing, change trees, and path tiers.
//!
//! Turns the per-file summary of a filesystem diff into normalized
//! [`ChangeRecord`](fwdelta_core::ChangeRecord)s, folds them into an
//! aggregated [`ChangeTree`](tree::ChangeTree), and classifies paths inside
//! application packages by security relevance.

pub mod filter;
pub mod parser;
pub mod rename;
pub mod tier;
pub mod tree;
