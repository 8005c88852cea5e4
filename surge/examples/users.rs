use std::{process::ExitCode, time::Duration};

use surge::{HttpEndpoint, RunConfig, Scenario, Stage, ThresholdSpec, UserWorkflow};
use tracing_subscriber::EnvFilter;

/// Ramp to 500 users over a minute, hold for three, ramp down over one.
fn default_config() -> Result<RunConfig, surge::ConfigError> {
    Ok(RunConfig::builder()
        .base_url("http://localhost:8080/api")
        .stages(vec![
            Stage::new(Duration::from_secs(60), 500),
            Stage::new(Duration::from_secs(180), 500),
            Stage::new(Duration::from_secs(60), 0),
        ])
        .thresholds(vec![
            ThresholdSpec::parse("http_req_duration", "p(95)<500")?,
            ThresholdSpec::parse("http_req_duration{type:create}", "p(95)<600")?,
            ThresholdSpec::parse("http_req_duration{type:get}", "p(95)<400")?,
            ThresholdSpec::parse("errors", "rate<0.1")?,
        ])
        .build())
}

// Run with `cargo run --example users [config.json]`, RUST_LOG=surge=debug for
// per-user detail.
#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("surge=info")),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => RunConfig::from_json(&std::fs::read_to_string(path)?)?,
        None => default_config()?,
    };

    // One client for the whole run, never one per request
    let endpoint = HttpEndpoint::new(&config.base_url, config.request_timeout)?;
    let summary = Scenario::builder()
        .name("users")
        .workflow(UserWorkflow::from_config(endpoint, &config))
        .config(config)
        .build()
        .run()
        .await?;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(if summary.passed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
