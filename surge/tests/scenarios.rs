//! Whole runs against an in-process stub of the users service, on tokio's paused
//! clock so latencies and delays are exact.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use serde_json::json;
use surge::{
    ConfigError, Endpoint, Error, Request, Response, RunConfig, RunSummary, Scenario, Stage,
    ThresholdSpec, TransportError, UserWorkflow, endpoint::Method,
};
use tokio::time::{Instant, sleep};

#[derive(Clone, Copy)]
enum Create {
    Created,
    ServerError,
    Unreachable,
}

#[derive(Debug, Clone)]
struct Call {
    method: Method,
    path: String,
    at: Instant,
}

struct State {
    create: Create,
    latency: Duration,
    next_id: AtomicU64,
    users: Mutex<HashMap<u64, String>>,
    calls: Mutex<Vec<Call>>,
}

#[derive(Clone)]
struct Stub(Arc<State>);

impl Stub {
    fn new(create: Create, latency: Duration) -> Self {
        Self(Arc::new(State {
            create,
            latency,
            next_id: AtomicU64::new(1),
            users: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }))
    }

    fn calls(&self) -> Vec<Call> {
        self.0.calls.lock().clone()
    }

    fn calls_to(&self, method: Method, prefix: &str) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| c.method == method && c.path.starts_with(prefix))
            .collect()
    }

    fn create_user(&self, request: &Request) -> Response {
        let body: serde_json::Value = request
            .body
            .as_deref()
            .and_then(|b| serde_json::from_slice(b).ok())
            .unwrap_or_default();
        let email = body["email"].as_str().unwrap_or_default().to_string();
        let id = self.0.next_id.fetch_add(1, Ordering::Relaxed);
        self.0.users.lock().insert(id, email.clone());
        Response::new(201, json!({ "id": id, "email": email }).to_string())
    }

    fn get_user(&self, path: &str) -> Response {
        let email = path
            .trim_start_matches("/users/")
            .parse::<u64>()
            .ok()
            .and_then(|id| self.0.users.lock().get(&id).cloned());
        match email {
            Some(email) => Response::new(200, json!({ "id": 1, "email": email }).to_string()),
            None => Response::new(404, "{}"),
        }
    }
}

impl Endpoint for Stub {
    async fn request(&self, request: &Request) -> Result<Response, TransportError> {
        self.0.calls.lock().push(Call {
            method: request.method,
            path: request.path.clone(),
            at: Instant::now(),
        });

        match (request.method, request.path.as_str()) {
            (Method::Post, "/users") => match self.0.create {
                Create::Unreachable => Err(TransportError::Connect("connection refused".into())),
                Create::ServerError => {
                    sleep(self.0.latency).await;
                    Ok(Response::new(500, r#"{"error": "boom"}"#))
                }
                Create::Created => {
                    sleep(self.0.latency).await;
                    Ok(self.create_user(request))
                }
            },
            (Method::Get, "/users") => {
                sleep(self.0.latency).await;
                Ok(Response::new(200, "[]"))
            }
            (Method::Get, path) => {
                sleep(self.0.latency).await;
                Ok(self.get_user(path))
            }
            (Method::Put, _) => {
                sleep(self.0.latency).await;
                Ok(Response::new(200, "{}"))
            }
            _ => Ok(Response::new(405, "")),
        }
    }
}

async fn run(stub: &Stub, config: RunConfig) -> Result<RunSummary, Error> {
    Scenario::builder()
        .name("users")
        .workflow(UserWorkflow::from_config(stub.clone(), &config))
        .config(config)
        .build()
        .run()
        .await
}

#[tokio::test(start_paused = true)]
async fn healthy_service_passes_thresholds() {
    let stub = Stub::new(Create::Created, Duration::from_millis(50));
    let config = RunConfig::builder()
        .base_url("http://stub.local/api")
        .stages(vec![Stage::new(Duration::from_secs(1), 10)])
        .thresholds(vec![ThresholdSpec::parse("create", "p(95)<1000").unwrap()])
        .build();

    let summary = run(&stub, config).await.unwrap();

    let create = summary.operations["create"];
    assert!(create.requests > 0);
    assert_eq!(create.failed, 0);
    assert!(create.latency.p95 >= 50.0 && create.latency.p95 < 52.0);
    for op in ["get", "update", "list"] {
        assert_eq!(summary.operations[op].requests, create.requests);
    }
    assert_eq!(summary.requests, 4 * create.requests);
    assert_eq!(summary.success_rate, Some(1.0));
    assert_eq!(summary.iterations, create.requests);
    assert!(summary.vus_max >= 9 && summary.vus_max <= 10);

    assert_eq!(summary.thresholds.len(), 1);
    assert!(summary.thresholds[0].passed);
    assert!(summary.passed);
}

#[tokio::test(start_paused = true)]
async fn failed_create_skips_get_and_update() {
    let stub = Stub::new(Create::ServerError, Duration::from_millis(50));
    let config = RunConfig::builder()
        .base_url("http://stub.local/api")
        .stages(vec![
            Stage::new(Duration::ZERO, 5),
            Stage::new(Duration::from_secs(3), 5),
        ])
        .thresholds(vec![ThresholdSpec::parse("errors", "rate<0.1").unwrap()])
        .build();

    let summary = run(&stub, config).await.unwrap();

    let create = summary.operations["create"];
    assert!(create.requests > 0);
    assert_eq!(create.failed, create.requests);
    assert_eq!(summary.operations["get"].requests, 0);
    assert_eq!(summary.operations["get"].latency.count, 0);
    assert_eq!(summary.operations["update"].requests, 0);
    assert_eq!(summary.operations["list"].requests, summary.iterations);
    assert_eq!(summary.operations["list"].failed, 0);

    // a 500 is an answer, never retried
    assert_eq!(
        stub.calls_to(Method::Post, "/users").len() as u64,
        create.requests
    );
    assert!(stub.calls_to(Method::Get, "/users/").is_empty());
    assert!(stub.calls_to(Method::Put, "/users/").is_empty());

    assert_eq!(summary.success_rate, Some(0.5));
    assert!(!summary.thresholds[0].passed);
    assert!(!summary.passed);
}

#[tokio::test(start_paused = true)]
async fn unreachable_create_is_attempted_max_retries_times() {
    let stub = Stub::new(Create::Unreachable, Duration::from_millis(50));
    let config = RunConfig::builder()
        .base_url("http://stub.local/api")
        .stages(vec![
            Stage::new(Duration::ZERO, 1),
            Stage::new(Duration::from_millis(100), 1),
        ])
        .max_retries(3)
        .retry_delay(Duration::from_millis(100))
        .build();

    let summary = run(&stub, config).await.unwrap();

    let creates = stub.calls_to(Method::Post, "/users");
    assert_eq!(creates.len(), 3);
    for pair in creates.windows(2) {
        assert!(pair[1].at - pair[0].at >= Duration::from_millis(100));
    }
    let span = creates[2].at - creates[0].at;
    assert!(span >= Duration::from_millis(200) && span < Duration::from_millis(210));

    // exhausted retries are one failed outcome, and list still runs
    assert_eq!(summary.operations["create"].requests, 1);
    assert_eq!(summary.operations["create"].failed, 1);
    assert_eq!(summary.operations["list"].requests, 1);
    assert_eq!(summary.iterations, 1);
}

#[tokio::test(start_paused = true)]
async fn invalid_config_spawns_nobody() {
    let stub = Stub::new(Create::Created, Duration::from_millis(50));
    let config = RunConfig::builder()
        .base_url("http://stub.local/api")
        .stages(vec![Stage::new(Duration::from_secs(1), 10)])
        .thresholds(vec![ThresholdSpec::parse("checks", "rate>0.9").unwrap()])
        .build();

    let outcome = run(&stub, config).await;

    assert!(matches!(
        outcome,
        Err(Error::Config(ConfigError::UnknownMetric(name))) if name == "checks"
    ));
    assert!(stub.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn empty_stages_are_rejected() {
    let stub = Stub::new(Create::Created, Duration::from_millis(50));
    let config = RunConfig::builder()
        .base_url("http://stub.local/api")
        .stages(vec![])
        .build();

    let outcome = run(&stub, config).await;

    assert!(matches!(outcome, Err(Error::Config(ConfigError::EmptyStages))));
    assert!(stub.calls().is_empty());
}
