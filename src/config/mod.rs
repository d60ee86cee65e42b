//! # viewcache Configuration Module
//!
//! This module centralizes all configuration constants for viewcache. Constants
//! are grouped by their functional area and interdependencies are documented
//! and enforced through compile-time assertions.
//!
//! ## Why Centralization?
//!
//! The window size, page size, index fanout and throttle charge cap all feed
//! each other: a window must be a whole number of pages, a one-level radix
//! tree must cover exactly the flat-index range, and the node-zone depth must
//! cover the full offset space. Co-locating these values with compile-time
//! checks prevents them drifting apart.
//!
//! ## Module Organization
//!
//! - [`constants`]: All numeric configuration values with dependency
//!   documentation

pub mod constants;
pub use constants::*;
