//! E2E test harness.
//!
//! This module carries infrastructure shared by the scenarios; some
//! builders and helpers are only used by a subset of them.

#![allow(dead_code)]

pub mod client;
pub mod tls;
pub mod world;

pub use client::AgentClient;
pub use world::World;
