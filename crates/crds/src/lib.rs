//! Featured CRD Definitions
//!
//! Kubernetes Custom Resource Definitions for the featured.io controller.

pub mod feature_flag;

pub use feature_flag::*;
