#![deny(unreachable_pub)]
//! Grid trading strategy engine
//!
//! Keeps a durable copy of every order a venue reports, reconciles snapshots
//! against the venue's full history, and drives long/short grid strategies that
//! rotate their ladder on each fill.

pub mod config;
pub mod engine;
pub mod grid;
pub mod market;
pub mod strategy;

pub use engine::{EngineConfig, StrategyEngine};
pub use grid::{GridError, GridResult};
