use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::sync::watch::{self, Receiver, Sender};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, sleep_until};
use typed_builder::TypedBuilder;

use futures::future::join_all;

use crate::{
    config::RunConfig,
    error::SinkError,
    metric::Sample,
    sink::{MetricSink, Tags},
    workflow::{UserContext, Workflow, names},
};
use internals::*;

/// A stage defines a target number of virtual users and how long to ramp to it.
///
/// Use `Stage::new(Duration::from_secs(60), 500)` to ramp to 500 users over a minute.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    /// Concurrently active virtual users at the end of the stage
    pub target: u32,
}

impl Stage {
    pub fn new(duration: Duration, target: u32) -> Self {
        Self { duration, target }
    }
}

/// Target concurrency of the stage curve after `elapsed`.
///
/// The curve starts at zero. Past the last stage it holds the last target.
pub fn target_at(stages: &[Stage], elapsed: Duration) -> u32 {
    let mut from = 0;
    let mut stage_start = Duration::ZERO;

    for stage in stages {
        let stage_end = stage_start.saturating_add(stage.duration);
        if elapsed < stage_end {
            return interpolate(from, stage.target, elapsed - stage_start, stage.duration);
        }
        // zero length stages fall through here, making them an instant jump
        from = stage.target;
        stage_start = stage_end;
    }
    from
}

/// Linear interpolation on integer nanoseconds, exact at both ends.
fn interpolate(from: u32, to: u32, progress: Duration, duration: Duration) -> u32 {
    let (from, to) = (i128::from(from), i128::from(to));
    let value = from + (to - from) * progress.as_nanos() as i128 / duration.as_nanos() as i128;
    value.clamp(0, i128::from(u32::MAX)) as u32
}

/// Index of the stage containing `elapsed`, `None` once every stage is over.
fn stage_index_at(stages: &[Stage], elapsed: Duration) -> Option<usize> {
    let mut stage_end = Duration::ZERO;
    stages.iter().position(|stage| {
        stage_end = stage_end.saturating_add(stage.duration);
        elapsed < stage_end
    })
}

/// What the controller observed while driving the stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RampOutcome {
    /// Peak of concurrently active virtual users
    pub vus_max: usize,
    /// Virtual users that did not exit within the graceful stop period
    pub stragglers: usize,
    /// Wall time from the first tick until the last virtual user was awaited
    pub duration: Duration,
}

const MIN_TICK: Duration = Duration::from_millis(1);

/// Drives virtual users along a piecewise linear concurrency curve.
///
/// - Every `tick` the active count is reconciled with [`target_at`].
/// - Each virtual user repeats `Workflow::run_iteration` with `iteration_pause` in
///   between, until it is told to stop.
/// - After the last stage all users are told to stop and get `graceful_stop` to exit.
#[derive(Debug, Clone, TypedBuilder)]
pub struct RampController {
    pub stages: Vec<Stage>,
    #[builder(default = Duration::from_millis(100))]
    pub tick: Duration,
    #[builder(default = Duration::from_secs(1))]
    pub iteration_pause: Duration,
    #[builder(default = Duration::from_secs(30))]
    pub graceful_stop: Duration,
}

impl RampController {
    pub fn from_config(config: &RunConfig) -> Self {
        Self {
            stages: config.stages.clone(),
            tick: config.tick,
            iteration_pause: config.iteration_pause,
            graceful_stop: config.graceful_stop,
        }
    }

    /// Sum of all stage durations, saturating at `Duration::MAX`.
    pub fn total_duration(&self) -> Duration {
        self.stages
            .iter()
            .fold(Duration::ZERO, |total, s| total.saturating_add(s.duration))
    }

    /// Run `workflow` until the stages are over and the users have stopped.
    ///
    /// Only a sink error other than [`SinkError::Sealed`] fails the run; every user
    /// is signaled to stop before it is returned.
    pub async fn run<W>(
        &self,
        workflow: Arc<W>,
        sink: Arc<MetricSink>,
    ) -> Result<RampOutcome, SinkError>
    where
        W: Workflow,
    {
        let total = self.total_duration();
        // a zero tick would never let the loop sleep
        let tick = self.tick.max(MIN_TICK);
        let start = Instant::now();
        let mut next_tick = start;
        let mut active: Vec<VirtualUser> = Vec::new();
        let mut retiring: Vec<VirtualUser> = Vec::new();
        let mut next_index = 0;
        let mut vus_max = 0;
        let mut current_stage = None;

        tracing::info!("Running {} stages over {:?}...", self.stages.len(), total);
        loop {
            let elapsed = start.elapsed();

            let stage = stage_index_at(&self.stages, elapsed);
            if stage != current_stage {
                if let Some(i) = stage {
                    tracing::info!("Starting stage: {}/{}", i + 1, self.stages.len());
                }
                current_stage = stage;
            }

            let reaped = match reap(&mut active).await {
                Ok(()) => reap(&mut retiring).await,
                Err(e) => Err(e),
            };
            if let Err(e) = reaped {
                tracing::error!("Aborting run: {e}");
                active.iter().chain(retiring.iter()).for_each(VirtualUser::stop);
                return Err(e);
            }

            if elapsed >= total {
                break;
            }

            let target = target_at(&self.stages, elapsed) as usize;
            while active.len() < target {
                active.push(VirtualUser::spawn(
                    UserContext::new(next_index, sink.clone()),
                    workflow.clone(),
                    self.iteration_pause,
                ));
                next_index += 1;
            }
            // newest first, the longest running users keep going
            while active.len() > target {
                if let Some(vu) = active.pop() {
                    vu.stop();
                    retiring.push(vu);
                }
            }
            vus_max = vus_max.max(active.len());

            next_tick += tick;
            sleep_until(next_tick).await;
        }

        tracing::info!("All stages done, stopping {} virtual users...", active.len());
        retiring.append(&mut active);
        retiring.iter().for_each(VirtualUser::stop);

        let mut handles: Vec<_> = retiring.into_iter().map(|vu| vu.handle).collect();
        let drained = tokio::time::timeout(self.graceful_stop, join_all(handles.iter_mut())).await;
        let stragglers = match drained {
            Ok(results) => {
                for result in results {
                    match result {
                        Ok(outcome) => outcome?,
                        Err(e) => tracing::error!("Virtual user panicked: {e}"),
                    }
                }
                0
            }
            Err(_) => {
                let left = handles.iter().filter(|h| !h.is_finished()).count();
                tracing::warn!(
                    "{left} virtual users still running after {:?}, leaving them behind",
                    self.graceful_stop
                );
                left
            }
        };

        tracing::info!("Ramp finished, peak of {vus_max} virtual users");
        Ok(RampOutcome {
            vus_max,
            stragglers,
            duration: start.elapsed(),
        })
    }
}

/// Await the users that already exited and drop them from `vus`.
async fn reap(vus: &mut Vec<VirtualUser>) -> Result<(), SinkError> {
    if !vus.iter().any(VirtualUser::is_finished) {
        return Ok(());
    }
    let (finished, running): (Vec<_>, Vec<_>) =
        vus.drain(..).partition(VirtualUser::is_finished);
    *vus = running;
    for vu in finished {
        vu.join().await?;
    }
    Ok(())
}

#[cfg(feature = "internals")]
pub use internals::*;

mod internals {
    use super::*;

    /// A spawned virtual user and the switch that tells it to stop.
    pub struct VirtualUser {
        pub index: usize,
        pub stop: Sender<bool>,
        pub handle: JoinHandle<Result<(), SinkError>>,
    }

    impl VirtualUser {
        pub fn spawn<W>(ctx: UserContext, workflow: Arc<W>, pause: Duration) -> Self
        where
            W: Workflow,
        {
            let (stop, stopped) = watch::channel(false);
            let index = ctx.vu;
            tracing::debug!("Spawning virtual user {index}");
            let handle = tokio::spawn(user_loop(ctx, workflow, pause, stopped));
            Self {
                index,
                stop,
                handle,
            }
        }

        pub fn stop(&self) {
            // the user may already be gone, nothing left to signal then
            let _ = self.stop.send(true);
        }

        pub fn is_finished(&self) -> bool {
            self.handle.is_finished()
        }

        /// Wait for the user to exit. A panic is logged and otherwise ignored.
        pub async fn join(self) -> Result<(), SinkError> {
            match self.handle.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!("Virtual user {} panicked: {e}", self.index);
                    Ok(())
                }
            }
        }
    }

    /// Iterate until told to stop. The signal is only honored between iterations.
    pub async fn user_loop<W>(
        mut ctx: UserContext,
        workflow: Arc<W>,
        pause: Duration,
        mut stopped: Receiver<bool>,
    ) -> Result<(), SinkError>
    where
        W: Workflow,
    {
        loop {
            if *stopped.borrow() {
                break;
            }

            let started = Instant::now();
            let outcome = match workflow.run_iteration(&ctx).await {
                Ok(()) => record_iteration(&ctx.sink, started.elapsed()),
                Err(e) => Err(e),
            };
            match outcome {
                Ok(()) => ctx.iteration += 1,
                Err(SinkError::Sealed) => {
                    tracing::debug!(
                        "Virtual user {} finished after the sink was sealed",
                        ctx.vu
                    );
                    return Ok(());
                }
                Err(e) => {
                    tracing::error!("Virtual user {} failed: {e}", ctx.vu);
                    return Err(e);
                }
            }

            tokio::select! {
                _ = sleep(pause) => {}
                _ = stopped.wait_for(|b| *b) => break,
            }
        }
        tracing::debug!(
            "Virtual user {} stopped after {} iterations",
            ctx.vu,
            ctx.iteration
        );
        Ok(())
    }

    pub fn record_iteration(sink: &MetricSink, took: Duration) -> Result<(), SinkError> {
        let untagged = Tags::new();
        sink.record_batch(&[
            (names::ITERATIONS, Sample::Counter(1), &untagged),
            (names::ITERATION_DURATION, Sample::latency(took), &untagged),
        ])
    }
}
