use std::sync::Arc;

use typed_builder::TypedBuilder;

use crate::{
    config::RunConfig, error::Error, executor::RampController, report::RunSummary,
    sink::MetricSink, workflow::Workflow,
};

/// A named run of a [`Workflow`] under a [`RunConfig`].
///
/// `run` validates the configuration before any virtual user exists, drives the
/// stages, seals the sink and summarizes it.
#[derive(Debug, Clone, TypedBuilder)]
pub struct Scenario<W>
where
    W: Workflow,
{
    #[builder(setter(into))]
    pub name: String,
    pub workflow: W,
    pub config: RunConfig,
}

impl<W> Scenario<W>
where
    W: Workflow,
{
    pub async fn run(self) -> Result<RunSummary, Error> {
        self.config.validate(&self.workflow.metrics())?;

        let sink = Arc::new(MetricSink::new());
        let controller = RampController::from_config(&self.config);
        let operations = self.workflow.operations().to_vec();

        tracing::info!("Running scenario: {}", self.name);
        let ramp = controller.run(Arc::new(self.workflow), sink.clone()).await?;

        tracing::info!("Processing results...");
        let snapshot = sink.seal();
        let summary = RunSummary::build(&snapshot, &operations, &self.config.thresholds, &ramp)?;

        tracing::info!(
            "Done running scenario: {} ({})",
            self.name,
            if summary.passed { "passed" } else { "failed" }
        );
        Ok(summary)
    }
}
