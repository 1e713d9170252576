//! `watch-runtime`: the concurrent watch pipeline.
//!
//! Per-provider watcher (scheduled polling, hashed diffing, cached
//! baseline) → event merger (fan-in with rate-aware dropping) → correlator
//! (rule-driven cross-provider grouping) → delivery pipeline (staged worker
//! pools with routing, backpressure, circuit-breaker, retry), all owned and
//! sequenced by a [`controller::Controller`].
//!
//! Collectors, sinks, CLI, and config-file loading are peripheral and live
//! in the `watch-cli` binary crate; this crate only defines the contracts
//! they implement ([`collector::Collector`], [`sink::Sink`]).

pub mod clock;
pub mod collector;
pub mod config;
pub mod controller;
pub mod correlator;
pub mod error;
pub mod merger;
pub mod metrics;
pub mod model;
pub mod pipeline;
pub mod rate_limit;
pub mod sink;
pub mod watcher;
