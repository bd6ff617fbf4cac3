//! YIELDARB: replicated lending yield-arbitrage agent
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod clock;
pub mod config;
pub mod engine;
pub mod execution;
pub mod health;
pub mod mapping;
pub mod rounds;
pub mod sources;
pub mod state;
pub mod storage;
pub mod strategy;
pub mod tokens;
pub mod types;
