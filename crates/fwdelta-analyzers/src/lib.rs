//! Deep analysis of changed firmware artifacts.
//!
//! Each changed artifact present in both snapshots is routed to an
//! [`Analyzer`](dispatch::Analyzer) chosen by [`dispatch::Detector`]:
//! ELF binaries, vendor-wrapped trusted apps, application packages and
//! certificate store entries. Results are collected into a
//! [`DigestCollection`](aggregator::DigestCollection) by the
//! [`DigestPipeline`](pipeline::DigestPipeline).
//!
//! External tools (`radiff2`, `checksec`, `dexdump`) sit behind traits in
//! [`tools`] and [`archive`] so every analyzer can be exercised with stubs.

pub mod aggregator;
pub mod archive;
pub mod binary;
pub mod cert;
pub mod digest;
pub mod dispatch;
pub mod entropy;
pub mod hardening;
pub mod kernel;
pub mod pipeline;
pub mod tools;
pub mod wrapped;
