//! Prometheus exporter for PurpleAir air-quality sensors.
//!
//! The exporter polls each configured sensor's `/json` status document on a
//! fixed interval and republishes selected fields as labeled gauges on an
//! HTTP `/metrics` endpoint.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌─────────────────┐     ┌─────────────────┐
//! │    Scheduler    │────>│   ScrapeCycle   │────>│ MetricsRegistry │<────│   HTTP Server   │
//! │  (fixed tick)   │     │ (fan-out/join)  │     │    (gauges)     │     │   (/metrics)    │
//! └─────────────────┘     └─────────────────┘     └─────────────────┘     └─────────────────┘
//!                                  │
//!                                  v
//!                         SensorClient x N (GET http://<addr>/json)
//! ```
//!
//! # Usage
//!
//! ```bash
//! purple-exporter --sensor-addr 10.0.0.5:80 --sensor-addr 10.0.0.6:80 --listen 0.0.0.0:8080
//! ```
//!
//! # Configuration
//!
//! See [`config::ExporterConfig`] for configuration options.

pub mod config;
pub mod http;
pub mod mapping;
pub mod registry;
pub mod scheduler;
pub mod scrape;
pub mod sensor;

pub use config::ExporterConfig;
pub use http::HttpServer;
pub use registry::{MetricsRegistry, SharedRegistry};
pub use scheduler::{Scheduler, SchedulerState, Ticker, interval_ticker};
pub use scrape::{CycleReport, ScrapeCycle, SensorOutcome};
pub use sensor::{FetchError, SensorClient, SensorSource, SensorStatus};
