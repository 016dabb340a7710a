//! # mailpump
//!
//! Drains a Postgres backlog of queued emails through a bounded worker pool.
//!
//! Emails are claimed with `FOR UPDATE SKIP LOCKED` and flipped to
//! `processing` in the same transaction, fed through a bounded queue to a
//! fixed set of workers, throttled by a local or Redis-backed token bucket,
//! "sent" with a simulated delay, and marked `sent` exactly once.

pub mod api;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod model;
pub mod ratelimit;
pub mod store;
pub mod telemetry;
