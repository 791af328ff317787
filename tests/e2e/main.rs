//! End-to-end tests for the correlation server.

mod harness;
mod scenarios;
