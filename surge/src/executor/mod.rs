//! Executor: drives the virtual users of a run along the stage curve.
//!
//! A run is described by a list of [`Stage`]s. Each stage ramps the target number of
//! concurrently active virtual users linearly from the previous stage's target (zero
//! for the first stage) to its own target over its duration. A stage whose target
//! equals the previous one is a plateau; a stage with a zero duration is an instant
//! jump.
//!
//! # Curve
//!
//! For a stage starting at `t0` with duration `d`, previous target `from` and own
//! target `to`, the target at `t0 <= t < t0 + d` is
//!
//! ```text
//! target(t) = from + (to - from) * (t - t0) / d
//! ```
//!
//! computed on integer nanoseconds, so `target(t0) == from` and the value reached at
//! `t0 + d` is exactly `to`. See [`target_at`].
//!
//! # Reconcile loop
//!
//! The [`RampController`] wakes up every `tick` and:
//!
//! 1. reaps virtual users that have exited, failing the run if one of them hit a
//!    fatal sink error;
//! 2. spawns virtual users while fewer than `target(t)` are active;
//! 3. signals the most recently spawned ones to stop while more than `target(t)` are
//!    active.
//!
//! Stopping is cooperative: a virtual user checks its stop signal between
//! iterations and during the pause that follows each iteration, never in the middle
//! of an operation. Once the sum of the stage durations has elapsed every virtual
//! user is signaled, and the controller waits at most `graceful_stop` for them to
//! exit. Stragglers are left behind; whatever they record after the sink is sealed
//! is rejected by the sink.
//!
//! # Tuning knobs
//! - `tick`: reconcile period. The curve is sampled once per tick, so spawning
//!   follows a steep ramp with at most one tick of lag.
//! - `iteration_pause`: sleep of each virtual user after an iteration, which bounds
//!   the request rate one user can produce.
//! - `graceful_stop`: how long finishing iterations may delay the summary.
pub mod stage;
pub use stage::{RampController, RampOutcome, Stage, target_at};
