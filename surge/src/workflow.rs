//! What one virtual user does per iteration.
//!
//! A [`Workflow`] runs a sequence of operations and writes their outcomes into the
//! [`MetricSink`] of the run. [`UserWorkflow`] is the built-in CRUD workflow against a
//! `/users` resource: create, then get and update the created user if the create
//! succeeded, then list regardless.

use std::{fmt, future::Future, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::time::{Instant, timeout};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::{
    config::RunConfig,
    endpoint::{Endpoint, Request, Response},
    error::SinkError,
    metric::{MetricKind, Sample},
    retry::{AttemptResult, Operation, RetryExecutor, RetryPolicy},
    sink::{MetricSink, Tags, tags},
};

/// Names of the metrics every workflow run records.
pub mod names {
    /// Counter, one per finished iteration.
    pub const ITERATIONS: &str = "iterations";
    /// Trend, wall time of each iteration in milliseconds.
    pub const ITERATION_DURATION: &str = "iteration_duration";
    /// Trend, latency of each operation in milliseconds, tagged `type=<operation>`.
    pub const HTTP_REQ_DURATION: &str = "http_req_duration";
    /// Counter, one per operation outcome, tagged `type=<operation>`.
    pub const HTTP_REQS: &str = "http_reqs";
    /// Rate, `true` for every failed operation, tagged `type=<operation>`.
    pub const ERRORS: &str = "errors";
    /// Tag key carrying the operation name.
    pub const TYPE_TAG: &str = "type";
}

/// A metric a workflow promises to record, used to validate thresholds up front.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricDecl {
    pub name: String,
    pub kind: MetricKind,
}

impl MetricDecl {
    pub fn new(name: impl Into<String>, kind: MetricKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Metrics recorded by the run itself plus those of [`record_outcome`] for each
/// operation.
pub fn builtin_metrics(operations: &[&str]) -> Vec<MetricDecl> {
    let mut decls = vec![
        MetricDecl::new(names::ITERATIONS, MetricKind::Counter),
        MetricDecl::new(names::ITERATION_DURATION, MetricKind::Trend),
        MetricDecl::new(names::HTTP_REQ_DURATION, MetricKind::Trend),
        MetricDecl::new(names::HTTP_REQS, MetricKind::Counter),
        MetricDecl::new(names::ERRORS, MetricKind::Rate),
    ];
    decls.extend(
        operations
            .iter()
            .map(|op| MetricDecl::new(*op, MetricKind::Trend)),
    );
    decls
}

/// Per virtual user state handed to every iteration.
#[derive(Clone)]
pub struct UserContext {
    pub vu: usize,
    pub iteration: u64,
    pub sink: Arc<MetricSink>,
}

impl UserContext {
    pub fn new(vu: usize, sink: Arc<MetricSink>) -> Self {
        Self {
            vu,
            iteration: 0,
            sink,
        }
    }
}

/// The iteration a virtual user repeats while it is active.
///
/// An iteration only fails when the sink does; failed requests are outcomes to
/// record, not errors.
pub trait Workflow
where
    Self: Send + Sync + 'static,
{
    /// Names of the operations, in the order an iteration may run them.
    fn operations(&self) -> &[&'static str];

    /// Every metric this workflow records.
    fn metrics(&self) -> Vec<MetricDecl> {
        builtin_metrics(self.operations())
    }

    fn run_iteration(
        &self,
        ctx: &UserContext,
    ) -> impl Future<Output = Result<(), SinkError>> + Send;
}

/// Write one finished operation into the sink as a single batch.
pub fn record_outcome<T>(
    sink: &MetricSink,
    operation: &str,
    result: &AttemptResult<T>,
) -> Result<(), SinkError> {
    let latency = Sample::latency(result.latency);
    let tagged = tags([(names::TYPE_TAG, operation)]);
    let untagged = Tags::new();
    sink.record_batch(&[
        (operation, latency, &untagged),
        (names::HTTP_REQ_DURATION, latency, &tagged),
        (names::HTTP_REQS, Sample::Counter(1), &tagged),
        (names::ERRORS, Sample::Rate(!result.is_success()), &tagged),
    ])
}

/// One request against an [`Endpoint`] with a success check over the response.
///
/// Each attempt is bounded by `timeout`; running out of time counts as a network
/// error.
pub struct HttpOperation<'a, E, C> {
    name: &'a str,
    endpoint: &'a E,
    request: Request,
    timeout: Duration,
    check: C,
}

impl<'a, E, C> HttpOperation<'a, E, C>
where
    E: Endpoint,
    C: Fn(&Response) -> bool + Send + Sync,
{
    pub fn new(
        name: &'a str,
        endpoint: &'a E,
        request: Request,
        timeout: Duration,
        check: C,
    ) -> Self {
        Self {
            name,
            endpoint,
            request,
            timeout,
            check,
        }
    }
}

impl<E, C> Operation for HttpOperation<'_, E, C>
where
    E: Endpoint,
    C: Fn(&Response) -> bool + Send + Sync,
{
    type Output = Response;

    fn name(&self) -> &str {
        self.name
    }

    async fn attempt(&self) -> AttemptResult<Response> {
        let start = Instant::now();
        let outcome = timeout(self.timeout, self.endpoint.request(&self.request)).await;
        let latency = start.elapsed();

        match outcome {
            Err(_) => {
                tracing::debug!(
                    "{} {} timed out after {:?}",
                    self.request.method,
                    self.request.path,
                    self.timeout
                );
                AttemptResult::network_error(latency)
            }
            Ok(Err(e)) => {
                tracing::debug!("{} {} failed: {e}", self.request.method, self.request.path);
                AttemptResult::network_error(latency)
            }
            Ok(Ok(response)) if (self.check)(&response) => {
                AttemptResult::success(latency, response)
            }
            Ok(Ok(response)) => {
                tracing::debug!(
                    "{} {} failed its check with status {}",
                    self.request.method,
                    self.request.path,
                    response.status
                );
                AttemptResult::failure(latency, Some(response))
            }
        }
    }
}

/// Identifier of a created resource; the service may use numbers or strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResourceId {
    Number(u64),
    Text(String),
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceId::Number(n) => write!(f, "{n}"),
            ResourceId::Text(s) => f.write_str(s),
        }
    }
}

/// Synthetic input of one iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewUser {
    pub name: String,
    pub email: String,
    pub password: String,
}

impl NewUser {
    /// Fresh user data for virtual user `vu`.
    ///
    /// The suffix is a UUIDv7 (millisecond timestamp plus random bits) prefixed with the
    /// virtual user index, so concurrent iterations never share an email.
    pub fn generate(vu: usize) -> Self {
        let suffix = format!("{vu}x{}", Uuid::now_v7().simple());
        Self {
            name: format!("Test User {suffix}"),
            email: format!("test{suffix}@example.com"),
            password: format!("Test@{suffix}pass"),
        }
    }

    /// The same user with the name changed, as sent by the update operation.
    pub fn renamed(&self) -> Self {
        Self {
            name: format!("Updated {}", self.name),
            ..self.clone()
        }
    }
}

/// The part of a returned user the checks look at.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UserRecord {
    pub id: ResourceId,
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// Operations of [`UserWorkflow`], in order.
pub const USER_OPERATIONS: &[&str] = &["create", "get", "update", "list"];

/// Create, get, update and list users.
#[derive(TypedBuilder)]
pub struct UserWorkflow<E> {
    endpoint: E,
    #[builder(default)]
    retry: RetryPolicy,
    #[builder(default = Duration::from_secs(30))]
    request_timeout: Duration,
}

impl<E> UserWorkflow<E>
where
    E: Endpoint + 'static,
{
    /// Workflow using the retry and timeout settings of `config`.
    pub fn from_config(endpoint: E, config: &RunConfig) -> Self {
        Self {
            endpoint,
            retry: config.retry_policy(),
            request_timeout: config.request_timeout,
        }
    }

    /// Run one operation with retries and record its outcome.
    ///
    /// A body that cannot be encoded skips the operation without recording anything,
    /// since no attempt was made.
    async fn perform<C>(
        &self,
        ctx: &UserContext,
        name: &str,
        request: Result<Request, serde_json::Error>,
        check: C,
    ) -> Result<Option<AttemptResult<Response>>, SinkError>
    where
        C: Fn(&Response) -> bool + Send + Sync,
    {
        let request = match request {
            Ok(request) => request,
            Err(e) => {
                tracing::error!("VU {} could not encode {name} request: {e}", ctx.vu);
                return Ok(None);
            }
        };
        let operation =
            HttpOperation::new(name, &self.endpoint, request, self.request_timeout, check);
        let result = RetryExecutor::new(self.retry).execute(&operation).await;
        record_outcome(&ctx.sink, name, &result)?;
        Ok(Some(result))
    }
}

impl<E> Workflow for UserWorkflow<E>
where
    E: Endpoint + 'static,
{
    fn operations(&self) -> &[&'static str] {
        USER_OPERATIONS
    }

    async fn run_iteration(&self, ctx: &UserContext) -> Result<(), SinkError> {
        let user = NewUser::generate(ctx.vu);

        let create = self
            .perform(ctx, "create", Request::post("/users").json(&user), |r| {
                r.status == 201 && r.json::<UserRecord>().is_ok()
            })
            .await?;

        let created = create
            .filter(AttemptResult::is_success)
            .and_then(|result| result.payload)
            .and_then(|response| response.json::<UserRecord>().ok());

        if let Some(record) = created {
            let path = format!("/users/{}", record.id);
            let email = user.email.clone();
            self.perform(ctx, "get", Ok(Request::get(path.as_str())), move |r| {
                r.status == 200 && r.json::<UserRecord>().is_ok_and(|u| u.email == email)
            })
            .await?;

            let update = Request::put(path.as_str()).json(&user.renamed());
            self.perform(ctx, "update", update, |r| r.status == 200)
                .await?;
        }

        self.perform(ctx, "list", Ok(Request::get("/users")), |r| r.status == 200)
            .await?;
        Ok(())
    }
}
