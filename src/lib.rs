//! stat_channels: per-guild statistic channels kept in sync with a metrics feed
//!
//! Each guild gets one category holding two voice channels whose names show the
//! current price and the blocks left until the next halving. Channel ids live in
//! Sled; the reconciler converges whatever exists on the platform toward the
//! desired layout on every pass.

pub mod config;
pub mod display;
pub mod lifecycle;
pub mod metrics;
pub mod models;
pub mod platform;
pub mod reconcile;
// REST API module: read-only Axum status handlers on port 11111
pub mod rest;
pub mod scheduler;
pub mod status;
pub mod storage;
pub mod telemetry;
pub mod watcher;
