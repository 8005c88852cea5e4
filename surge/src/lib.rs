//! Surge: a staged virtual-user load generator for HTTP resource APIs.
//!
//! Surge runs a workflow of requests from a varying number of concurrent virtual
//! users, records what happened into a shared metric sink and turns it into a
//! pass/fail summary once the run is over, in the spirit of K6 scripts with
//! `stages` and `thresholds`.
//!
//! # Architecture
//!
//! The main building blocks are:
//!
//! - [`Scenario`]: glue that ties everything together. It validates the
//!   [`RunConfig`], drives the run and produces the [`RunSummary`].
//! - [`RampController`]: spawns and retires virtual users so that the number of
//!   active users follows the piecewise linear curve of the [`Stage`]s.
//! - [`Workflow`]: what a virtual user does per iteration. [`UserWorkflow`] is the
//!   built-in create, get, update, list workflow against a `/users` resource.
//! - [`RetryExecutor`]: attempts an [`Operation`] again while it gets no response at
//!   all. An answer that fails its check is final.
//! - [`MetricSink`]: the only shared mutable state of a run. Counters, rates and
//!   trends keyed by name and tags, written concurrently and read once sealed.
//! - [`ThresholdSpec`]: a condition such as `p(95)<500` over an aggregated metric,
//!   evaluated at the end of the run.
//!
//! # Example
//!
//! ```rust,no_run
//! use surge::{HttpEndpoint, RunConfig, Scenario, UserWorkflow};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RunConfig::from_json(r#"{
//!         "base_url": "http://localhost:8080/api",
//!         "stages": [
//!             { "duration": "30s", "target": 20 },
//!             { "duration": "1m", "target": 20 },
//!             { "duration": "30s", "target": 0 }
//!         ],
//!         "thresholds": [
//!             { "metric": "http_req_duration{type:create}", "condition": "p(95)<600" },
//!             { "metric": "errors", "condition": "rate<0.1" }
//!         ]
//!     }"#)?;
//!
//!     // One endpoint for the whole run, its connection pool is shared by every user.
//!     let endpoint = HttpEndpoint::new(&config.base_url, config.request_timeout)?;
//!     let summary = Scenario::builder()
//!         .name("users")
//!         .workflow(UserWorkflow::from_config(endpoint, &config))
//!         .config(config)
//!         .build()
//!         .run()
//!         .await?;
//!
//!     println!("{}", serde_json::to_string_pretty(&summary)?);
//!     Ok(())
//! }
//! ```
//!
//! # Feature flags
//!
//! - `builtins`: the reqwest backed [`HttpEndpoint`]. (Enabled by default)
//! - `internals`: exposes the virtual user plumbing of the ramp controller.

/// Counter, rate and trend aggregates
pub mod aggregate;
pub mod config;
/// The service under test
pub mod endpoint;
pub mod error;
/// Orchestration of virtual users along the stages
pub mod executor;
/// Single observations
pub mod metric;
/// End of run summary
pub mod report;
pub mod retry;
/// Main module of the framework that glues everything together
pub mod scenario;
/// Concurrent metric storage
pub mod sink;
pub mod threshold;
pub mod workflow;

pub use aggregate::Aggregate;
pub use config::RunConfig;
pub use endpoint::{Endpoint, Request, Response};
pub use error::{ConfigError, Error, SinkError, TransportError};
pub use executor::{RampController, Stage};
pub use report::RunSummary;
pub use retry::{AttemptResult, AttemptStatus, Operation, RetryExecutor, RetryPolicy};
pub use scenario::Scenario;
pub use sink::MetricSink;
pub use threshold::ThresholdSpec;
pub use workflow::{UserContext, UserWorkflow, Workflow};

#[cfg(feature = "builtins")]
pub use endpoint::HttpEndpoint;
