//! # orderq
//!
//! A reliable order work-queue pipeline over a message broker.
//!
//! A producer publishes synthetic orders as persistent messages to a durable
//! queue; a consumer receives them under a prefetch limit and acknowledges
//! each one only after its work completes, giving at-least-once processing.

pub mod broker;
pub mod config;
pub mod consumer;
pub mod error;
pub mod generator;
pub mod model;
pub mod producer;
pub mod telemetry;

pub use error::{Error, Result};
