//! Helpers and objects for describing what a simulated user does.
//!
//! A load test registers one or more [`UserBehavior`]s with the
//! [`Flock`](../struct.Flock.html) engine. Each behavior is a plain configuration record:
//!  - an optional startup hook, run one time by each user before anything else;
//!  - a table of weighted [`Task`]s, one of which is picked at random every cycle;
//!  - a [`WaitRange`], the user sleeps for a random duration from this range after
//!    every task.
//!
//! ## Creating a behavior
//!
//! ```rust
//! use std::time::Duration;
//!
//! use flock::prelude::*;
//!
//! fn website_user() -> Result<UserBehavior, FlockError> {
//!     Ok(behavior!("WebsiteUser")
//!         .register_task(task!(api).set_weight(5))
//!         .set_wait_time(Duration::from_millis(5), Duration::from_millis(500))?)
//! }
//!
//! async fn api(user: &mut FlockUser) -> TaskResult {
//!     let _flock = user.get("/api").await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Making requests
//!
//! Task functions receive a [`FlockUser`], a handle to the simulated user's own HTTP
//! client. Requests made through it are timed and sent to the engine as
//! [`RequestMetric`](../metrics/struct.RequestMetric.html)s. The `get`, `post`,
//! `post_form`, `head` and `delete` helpers return an error when the request fails
//! (a transport error or a non-2xx status code), so `?` fails the task. Custom requests
//! can be built with the `flock_*` helpers and sent with [`FlockUser::flock_send`].

use futures::FutureExt;
use http::Method;
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use std::{fmt, future::Future, pin::Pin};
use url::Url;

use crate::config::FlockConfiguration;
use crate::metrics::{FlockMetric, RequestMetric};
use crate::sampler::WeightedSampler;
use crate::{util, FlockError};

static APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Requests time out after 60 seconds unless `--timeout` says otherwise.
const DEFAULT_TIMEOUT_MS: u64 = 60_000;

/// `task!(foo)` expands to `Task::new(foo)` named "foo", boxing the async function.
#[macro_export]
macro_rules! task {
    ($task_func:ident) => {
        $crate::behavior::Task::new(std::sync::Arc::new(move |s| {
            std::boxed::Box::pin($task_func(s))
        }))
        .set_name(stringify!($task_func))
    };
}

/// `behavior!("foo")` expands to `UserBehavior::new("foo")`.
#[macro_export]
macro_rules! behavior {
    ($name:tt) => {
        $crate::behavior::UserBehavior::new($name)
    };
}

/// The result of a task function.
pub type TaskResult = Result<(), Box<TaskError>>;

/// The async function run by a [`Task`].
pub type TaskFunction = Arc<
    dyn for<'r> Fn(&'r mut FlockUser) -> Pin<Box<dyn Future<Output = TaskResult> + Send + 'r>>
        + Send
        + Sync,
>;

/// Errors a task function can return.
#[derive(Debug)]
pub enum TaskError {
    /// Wraps a [`reqwest::Error`](https://docs.rs/reqwest/*/reqwest/struct.Error.html).
    Reqwest(reqwest::Error),
    /// Wraps a [`url::ParseError`](https://docs.rs/url/*/url/enum.ParseError.html).
    Url(url::ParseError),
    /// The request failed, either on the transport or with a non-2xx status code. The
    /// metric describing the request is included.
    RequestFailed {
        /// The metric recorded for the failed request.
        raw_request: RequestMetric,
    },
    /// The request used a method metrics can't be collected for.
    InvalidMethod {
        /// The unsupported method.
        method: Method,
    },
    /// Failed to send a metric to the engine.
    MetricsFailed {
        /// Wraps a [`flume::SendError`](https://docs.rs/flume/*/flume/struct.SendError.html).
        source: flume::SendError<FlockMetric>,
    },
    /// Failed to send a request to the request logger.
    LoggerFailed {
        /// Wraps a [`flume::SendError`](https://docs.rs/flume/*/flume/struct.SendError.html).
        source: flume::SendError<Option<RequestMetric>>,
    },
    /// Any other failure, described by the task itself.
    Custom(String),
}
impl TaskError {
    fn describe(&self) -> &str {
        match *self {
            TaskError::Reqwest(_) => "reqwest::Error",
            TaskError::Url(_) => "url::ParseError",
            TaskError::RequestFailed { .. } => "request failed",
            TaskError::InvalidMethod { .. } => "invalid method",
            TaskError::MetricsFailed { .. } => "failed to send metrics to parent",
            TaskError::LoggerFailed { .. } => "failed to send log message to logger",
            TaskError::Custom(_) => "task failed",
        }
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            TaskError::Reqwest(ref source) => {
                write!(f, "TaskError: {} ({})", self.describe(), source)
            }
            TaskError::Url(ref source) => write!(f, "TaskError: {} ({})", self.describe(), source),
            TaskError::RequestFailed { ref raw_request } => {
                write!(f, "TaskError: {} ({})", self.describe(), raw_request.error)
            }
            TaskError::InvalidMethod { ref method } => {
                write!(f, "TaskError: {} ({})", self.describe(), method)
            }
            TaskError::MetricsFailed { ref source } => {
                write!(f, "TaskError: {} ({})", self.describe(), source)
            }
            TaskError::LoggerFailed { ref source } => {
                write!(f, "TaskError: {} ({})", self.describe(), source)
            }
            TaskError::Custom(ref detail) => write!(f, "TaskError: {} ({})", self.describe(), detail),
        }
    }
}

impl std::error::Error for TaskError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            TaskError::Reqwest(ref source) => Some(source),
            TaskError::Url(ref source) => Some(source),
            TaskError::MetricsFailed { ref source } => Some(source),
            TaskError::LoggerFailed { ref source } => Some(source),
            _ => None,
        }
    }
}

/// Auto-convert Reqwest errors.
impl From<reqwest::Error> for Box<TaskError> {
    fn from(err: reqwest::Error) -> Box<TaskError> {
        Box::new(TaskError::Reqwest(err))
    }
}

/// Auto-convert Url errors.
impl From<url::ParseError> for Box<TaskError> {
    fn from(err: url::ParseError) -> Box<TaskError> {
        Box::new(TaskError::Url(err))
    }
}

/// When the engine goes away, metrics can't be sent.
impl From<flume::SendError<FlockMetric>> for Box<TaskError> {
    fn from(source: flume::SendError<FlockMetric>) -> Box<TaskError> {
        Box::new(TaskError::MetricsFailed { source })
    }
}

/// When the request logger goes away, requests can't be logged.
impl From<flume::SendError<Option<RequestMetric>>> for Box<TaskError> {
    fn from(source: flume::SendError<Option<RequestMetric>>) -> Box<TaskError> {
        Box::new(TaskError::LoggerFailed { source })
    }
}

/// Commands sent from the engine to simulated users.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserCommand {
    /// Tell the user to stop, wherever it is in its cycle.
    Exit,
}

/// An individual task within a [`UserBehavior`].
#[derive(Clone)]
pub struct Task {
    /// An index into [`UserBehavior`]`.tasks`, indicating which task this is.
    pub tasks_index: usize,
    /// The task name, displayed with task metrics.
    pub name: String,
    /// How often this task is picked compared to the other tasks of its behavior.
    pub weight: usize,
    /// The function run each time this task is picked.
    pub function: TaskFunction,
}
impl Task {
    /// Create a task with a weight of 1. Usually created with the [`task!`] macro.
    pub fn new(function: TaskFunction) -> Self {
        trace!("new task");
        Task {
            tasks_index: usize::MAX,
            name: "".to_string(),
            weight: 1,
            function,
        }
    }

    /// Set the name displayed with this task's metrics.
    ///
    /// # Example
    /// ```rust
    /// use flock::prelude::*;
    ///
    /// task!(a_task_function).set_name("a");
    ///
    /// async fn a_task_function(user: &mut FlockUser) -> TaskResult {
    ///     let _flock = user.get("/a/").await?;
    ///
    ///     Ok(())
    /// }
    /// ```
    pub fn set_name(mut self, name: &str) -> Self {
        trace!("[{}] set_name: {}", self.tasks_index, name);
        self.name = name.to_string();
        self
    }

    /// Set the relative weight of this task. A task with a weight of 3 runs three times
    /// as often as a task with a weight of 1. A task with a weight of 0 never runs.
    ///
    /// # Example
    /// ```rust
    /// use flock::prelude::*;
    ///
    /// task!(api).set_weight(5);
    ///
    /// async fn api(user: &mut FlockUser) -> TaskResult {
    ///     let _flock = user.get("/api").await?;
    ///
    ///     Ok(())
    /// }
    /// ```
    pub fn set_weight(mut self, weight: usize) -> Self {
        trace!("{} [{}] set_weight: {}", self.name, self.tasks_index, weight);
        if weight == 0 {
            info!("task {} has a weight of 0 and will never run", self.name);
        }
        self.weight = weight;
        self
    }
}
impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("tasks_index", &self.tasks_index)
            .field("name", &self.name)
            .field("weight", &self.weight)
            .finish()
    }
}

/// How long a user sleeps after each task, sampled uniformly and inclusively.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WaitRange {
    min_wait: Duration,
    max_wait: Duration,
}
impl WaitRange {
    /// Returns [`FlockError::InvalidWaitTime`] if `min_wait` is larger than `max_wait`.
    pub fn new(min_wait: Duration, max_wait: Duration) -> Result<Self, FlockError> {
        if min_wait > max_wait {
            return Err(FlockError::InvalidWaitTime {
                min_wait: min_wait.as_millis() as usize,
                max_wait: max_wait.as_millis() as usize,
                detail: format!(
                    "min_wait ({:?}) can't be larger than max_wait ({:?}).",
                    min_wait, max_wait
                ),
            });
        }
        Ok(WaitRange { min_wait, max_wait })
    }

    pub fn min_wait(&self) -> Duration {
        self.min_wait
    }

    pub fn max_wait(&self) -> Duration {
        self.max_wait
    }

    /// Draw a wait duration from `[min_wait, max_wait]`.
    pub fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        if self.min_wait == self.max_wait {
            self.min_wait
        } else {
            rng.random_range(self.min_wait..=self.max_wait)
        }
    }
}

/// A user behavior: an optional startup hook, weighted tasks and a wait range.
#[derive(Clone, Debug)]
pub struct UserBehavior {
    /// The name of the behavior.
    pub name: String,
    /// An index into [`Flock`](../struct.Flock.html)`.behaviors`, indicating which
    /// behavior this is.
    pub behaviors_index: usize,
    /// How often users are assigned this behavior compared to other behaviors.
    pub weight: usize,
    /// How long users sleep after each task.
    pub wait: WaitRange,
    /// An optional task run one time by each user before any other task.
    pub on_start: Option<Task>,
    /// The weighted task table.
    pub tasks: Vec<Task>,
    /// An optional host to run this behavior against.
    pub host: Option<String>,
}
impl UserBehavior {
    /// Create an empty behavior with a weight of 1 and no wait. Usually created with the
    /// [`behavior!`] macro.
    pub fn new(name: &str) -> Self {
        trace!("new behavior: name: {}", name);
        UserBehavior {
            name: name.to_string(),
            behaviors_index: usize::MAX,
            weight: 1,
            wait: WaitRange::default(),
            on_start: None,
            tasks: Vec::new(),
            host: None,
        }
    }

    /// Add a task to the task table.
    pub fn register_task(mut self, mut task: Task) -> Self {
        trace!("{} register_task: {}", self.name, task.name);
        task.tasks_index = self.tasks.len();
        self.tasks.push(task);
        self
    }

    /// Run `task` one time when each user starts, before any other task. If it fails,
    /// the user stops.
    ///
    /// # Example
    /// ```rust
    /// use flock::prelude::*;
    ///
    /// behavior!("LoggedInUser").set_on_start(task!(login));
    ///
    /// async fn login(user: &mut FlockUser) -> TaskResult {
    ///     let _flock = user.post_form("/login", &[("username", "me")]).await?;
    ///
    ///     Ok(())
    /// }
    /// ```
    pub fn set_on_start(mut self, task: Task) -> Self {
        trace!("{} set_on_start: {}", self.name, task.name);
        self.on_start = Some(task);
        self
    }

    /// Set the inclusive range users sleep for after each task.
    ///
    /// # Example
    /// ```rust
    /// use std::time::Duration;
    ///
    /// use flock::prelude::*;
    ///
    /// fn main() -> Result<(), FlockError> {
    ///     behavior!("ExampleUsers")
    ///         .set_wait_time(Duration::from_millis(5), Duration::from_millis(500))?;
    ///
    ///     Ok(())
    /// }
    /// ```
    pub fn set_wait_time(mut self, min_wait: Duration, max_wait: Duration) -> Result<Self, FlockError> {
        trace!(
            "{} set_wait time: min: {:?} max: {:?}",
            self.name,
            min_wait,
            max_wait
        );
        self.wait = WaitRange::new(min_wait, max_wait)?;
        Ok(self)
    }

    /// Set how often users are assigned this behavior compared to other behaviors.
    pub fn set_weight(mut self, weight: usize) -> Result<Self, FlockError> {
        trace!("{} set_weight: {}", self.name, weight);
        if weight == 0 {
            return Err(FlockError::InvalidWeight {
                weight,
                detail: format!("Weight of behavior {} must be at least 1.", self.name),
            });
        }
        self.weight = weight;
        Ok(self)
    }

    /// Set a host for this behavior, used when `--host` isn't set.
    pub fn set_host(mut self, host: &str) -> Self {
        trace!("{} set_host: {}", self.name, host);
        // Host validation happens when the load test starts.
        self.host = Some(host.to_string());
        self
    }

    /// Build the sampler used to pick tasks.
    pub fn sampler(&self) -> Result<WeightedSampler, FlockError> {
        let weights: Vec<usize> = self.tasks.iter().map(|t| t.weight).collect();
        WeightedSampler::new(&weights).map_err(|e| match e {
            FlockError::InvalidWeight { weight, detail } => FlockError::InvalidWeight {
                weight,
                detail: format!("{} ({})", detail, self.name),
            },
            other => other,
        })
    }
}

/// Supported HTTP methods.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum_macros::Display,
)]
#[strum(serialize_all = "UPPERCASE")]
pub enum FlockMethod {
    Delete,
    Get,
    Head,
    Patch,
    Post,
    Put,
}

fn flock_method_from_method(method: Method) -> Result<FlockMethod, Box<TaskError>> {
    Ok(match method {
        Method::DELETE => FlockMethod::Delete,
        Method::GET => FlockMethod::Get,
        Method::HEAD => FlockMethod::Head,
        Method::PATCH => FlockMethod::Patch,
        Method::POST => FlockMethod::Post,
        Method::PUT => FlockMethod::Put,
        _ => {
            return Err(Box::new(TaskError::InvalidMethod { method }));
        }
    })
}

/// The metric recorded for a request, together with the server's response.
#[derive(Debug)]
pub struct FlockResponse {
    /// The recorded request.
    pub request: RequestMetric,
    /// The response, or why there isn't one.
    pub response: Result<Response, reqwest::Error>,
}
impl FlockResponse {
    pub fn new(request: RequestMetric, response: Result<Response, reqwest::Error>) -> Self {
        FlockResponse { request, response }
    }
}

/// The state of one simulated user, handed to every task it runs.
#[derive(Debug, Clone)]
pub struct FlockUser {
    /// When the load test started, request metrics are timestamped relative to it.
    pub started: Instant,
    /// An index into [`Flock`](../struct.Flock.html)`.behaviors`, indicating which
    /// behavior this user runs.
    pub behaviors_index: usize,
    /// This user's own HTTP client.
    pub client: Client,
    /// The base URL relative paths are joined to.
    pub base_url: Url,
    /// A local copy of the load test configuration.
    pub config: FlockConfiguration,
    /// A number identifying this user, starting from 0.
    pub weighted_users_index: usize,
    /// Channel to the engine, used to send metrics.
    pub(crate) channel_to_parent: Option<flume::Sender<FlockMetric>>,
    /// Channel to the request logger, if enabled.
    pub(crate) logger: Option<flume::Sender<Option<RequestMetric>>>,
}
impl FlockUser {
    /// Create a user with its own HTTP client.
    pub fn new(
        behaviors_index: usize,
        base_url: Url,
        configuration: &FlockConfiguration,
    ) -> Result<Self, FlockError> {
        trace!("new user");
        let timeout = match util::parse_float(configuration.timeout.as_deref()) {
            Some(seconds) => (seconds * 1_000.0) as u64,
            None => DEFAULT_TIMEOUT_MS,
        };
        let builder = Client::builder()
            .user_agent(APP_USER_AGENT)
            .timeout(Duration::from_millis(timeout))
            .gzip(!configuration.no_gzip);
        #[cfg(feature = "cookies")]
        let builder = builder.cookie_store(true);
        let client = builder.build()?;

        Ok(FlockUser {
            started: Instant::now(),
            behaviors_index,
            client,
            base_url,
            config: configuration.clone(),
            // Set when the user is launched.
            weighted_users_index: usize::MAX,
            channel_to_parent: None,
            logger: None,
        })
    }

    /// Prepend the base URL to a path. A path that already includes a host is returned
    /// as is.
    ///
    /// # Example
    /// ```rust
    /// use flock::prelude::*;
    ///
    /// async fn show_url(user: &mut FlockUser) -> TaskResult {
    ///     // With `--host http://10.1.1.42` this prints `http://10.1.1.42/api`.
    ///     println!("{}", user.build_url("/api")?);
    ///
    ///     Ok(())
    /// }
    /// ```
    pub fn build_url(&self, path: &str) -> Result<String, Box<TaskError>> {
        // If URL includes a host, use it.
        if let Ok(parsed_path) = Url::parse(path) {
            if parsed_path.host().is_some() {
                return Ok(path.to_string());
            }
        }

        Ok(self.base_url.join(path)?.to_string())
    }

    /// GET `path`, failing the task if the request fails.
    ///
    /// # Example
    /// ```rust
    /// use flock::prelude::*;
    ///
    /// let mut task = task!(api);
    ///
    /// async fn api(user: &mut FlockUser) -> TaskResult {
    ///     let _flock = user.get("/api").await?;
    ///
    ///     Ok(())
    /// }
    /// ```
    pub async fn get(&mut self, path: &str) -> Result<FlockResponse, Box<TaskError>> {
        let request_builder = self.flock_get(path)?;
        self.request(request_builder).await
    }

    /// POST `body` to `path`, failing the task if the request fails.
    pub async fn post(
        &mut self,
        path: &str,
        body: String,
    ) -> Result<FlockResponse, Box<TaskError>> {
        let request_builder = self.flock_post(path)?.body(body);
        self.request(request_builder).await
    }

    /// POST a url-encoded form to `path`, failing the task if the request fails.
    ///
    /// # Example
    /// ```rust
    /// use flock::prelude::*;
    ///
    /// let mut task = task!(login);
    ///
    /// async fn login(user: &mut FlockUser) -> TaskResult {
    ///     let params = [("username", "me"), ("password", "s3crET!")];
    ///     let _flock = user.post_form("/login", &params).await?;
    ///
    ///     Ok(())
    /// }
    /// ```
    pub async fn post_form<T: Serialize + ?Sized>(
        &mut self,
        path: &str,
        form: &T,
    ) -> Result<FlockResponse, Box<TaskError>> {
        let request_builder = self.flock_post(path)?.form(form);
        self.request(request_builder).await
    }

    /// HEAD `path`, failing the task if the request fails.
    pub async fn head(&mut self, path: &str) -> Result<FlockResponse, Box<TaskError>> {
        let request_builder = self.flock_head(path)?;
        self.request(request_builder).await
    }

    /// DELETE `path`, failing the task if the request fails.
    pub async fn delete(&mut self, path: &str) -> Result<FlockResponse, Box<TaskError>> {
        let request_builder = self.flock_delete(path)?;
        self.request(request_builder).await
    }

    /// Prepare a GET request builder for `path`.
    pub fn flock_get(&self, path: &str) -> Result<RequestBuilder, Box<TaskError>> {
        let url = self.build_url(path)?;
        Ok(self.client.get(&url))
    }

    /// Prepare a POST request builder for `path`.
    pub fn flock_post(&self, path: &str) -> Result<RequestBuilder, Box<TaskError>> {
        let url = self.build_url(path)?;
        Ok(self.client.post(&url))
    }

    /// Prepare a HEAD request builder for `path`.
    pub fn flock_head(&self, path: &str) -> Result<RequestBuilder, Box<TaskError>> {
        let url = self.build_url(path)?;
        Ok(self.client.head(&url))
    }

    /// Prepare a PUT request builder for `path`.
    pub fn flock_put(&self, path: &str) -> Result<RequestBuilder, Box<TaskError>> {
        let url = self.build_url(path)?;
        Ok(self.client.put(&url))
    }

    /// Prepare a PATCH request builder for `path`.
    pub fn flock_patch(&self, path: &str) -> Result<RequestBuilder, Box<TaskError>> {
        let url = self.build_url(path)?;
        Ok(self.client.patch(&url))
    }

    /// Prepare a DELETE request builder for `path`.
    pub fn flock_delete(&self, path: &str) -> Result<RequestBuilder, Box<TaskError>> {
        let url = self.build_url(path)?;
        Ok(self.client.delete(&url))
    }

    /// Build and send a request, recording its metric.
    ///
    /// Unlike the `get`/`post`/... helpers, a failed request is not an error here: the
    /// returned [`FlockResponse`] is inspected by the task, for example when a 404 is
    /// the expected answer.
    ///
    /// # Example
    /// ```rust
    /// use std::time::Duration;
    ///
    /// use flock::prelude::*;
    ///
    /// let mut task = task!(slow_page);
    ///
    /// async fn slow_page(user: &mut FlockUser) -> TaskResult {
    ///     let request_builder = user.flock_get("/slow")?;
    ///     let flock = user
    ///         .flock_send(request_builder.timeout(Duration::from_secs(3)))
    ///         .await?;
    ///     if !flock.request.success {
    ///         return Err(Box::new(TaskError::Custom("slow page failed".to_string())));
    ///     }
    ///
    ///     Ok(())
    /// }
    /// ```
    pub async fn flock_send(
        &mut self,
        request_builder: RequestBuilder,
    ) -> Result<FlockResponse, Box<TaskError>> {
        let started = Instant::now();
        let request = request_builder.build()?;

        let method = flock_method_from_method(request.method().clone())?;
        // Requests are named by their path.
        let request_name = request.url().path().to_string();
        let url = request.url().to_string();
        let mut request_metric = RequestMetric::new(
            method,
            &request_name,
            &url,
            self.started.elapsed().as_millis(),
            self.weighted_users_index,
        );

        // Make the actual request.
        let response = self.client.execute(request).await;
        request_metric.set_response_time(started.elapsed().as_millis());

        match &response {
            Ok(r) => {
                let status_code = r.status();
                debug!("{:?}: status_code {}", &request_name, status_code);
                request_metric.set_status_code(Some(status_code));
                request_metric.set_final_url(r.url().as_str());
                if !status_code.is_success() {
                    request_metric.success = false;
                    request_metric.error = format!("{}: {}", status_code, &request_name);
                }
            }
            Err(e) => {
                warn!("{:?}: {}", &request_name, e);
                request_metric.success = false;
                request_metric.error = e.to_string();
                request_metric.set_status_code(None);
            }
        };

        self.send_request_metric(&request_metric)?;

        Ok(FlockResponse::new(request_metric, response))
    }

    // Send the request and turn a failed request into an error.
    async fn request(
        &mut self,
        request_builder: RequestBuilder,
    ) -> Result<FlockResponse, Box<TaskError>> {
        let flock = self.flock_send(request_builder).await?;
        if !flock.request.success {
            return Err(Box::new(TaskError::RequestFailed {
                raw_request: flock.request,
            }));
        }
        Ok(flock)
    }

    // Copy the metric to the request logger if enabled, then to the engine unless
    // metrics are disabled.
    fn send_request_metric(&self, request_metric: &RequestMetric) -> Result<(), Box<TaskError>> {
        if let Some(logger) = self.logger.as_ref() {
            logger.send(Some(request_metric.clone()))?;
        }

        if !self.config.no_metrics {
            if let Some(parent) = self.channel_to_parent.as_ref() {
                parent.send(FlockMetric::Request(request_metric.clone()))?;
            }
        }

        Ok(())
    }
}

/// Why a startup hook or task didn't complete.
#[derive(Debug)]
pub(crate) enum TaskFailure {
    /// The function returned an error.
    Error(Box<TaskError>),
    /// The function panicked.
    Panic(String),
}
impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TaskFailure::Error(e) => write!(f, "{}", e),
            TaskFailure::Panic(message) => write!(f, "panicked: {}", message),
        }
    }
}

/// Run a task function, catching a panic so it can be reported like an error.
pub(crate) async fn run_guarded(
    function: &TaskFunction,
    user: &mut FlockUser,
) -> Result<(), TaskFailure> {
    match AssertUnwindSafe(function(user)).catch_unwind().await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(TaskFailure::Error(e)),
        Err(panic) => {
            let message = if let Some(s) = panic.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = panic.downcast_ref::<String>() {
                s.clone()
            } else {
                "unknown panic".to_string()
            };
            Err(TaskFailure::Panic(message))
        }
    }
}

/// Determine the base URL of a behavior. The `--host` option wins over a host set on
/// the behavior, which wins over [`FlockDefault::Host`](../config/enum.FlockDefault.html#variant.Host).
pub fn get_base_url(
    config_host: Option<String>,
    behavior_host: Option<String>,
    default_host: Option<String>,
) -> Result<Url, FlockError> {
    let host = config_host
        .or(behavior_host)
        .or(default_host)
        .ok_or_else(|| FlockError::InvalidOption {
            option: "--host".to_string(),
            value: "".to_string(),
            detail: "A host must be defined via the --host option, the Flock.set_default() function, or the UserBehavior.set_host() function.".to_string(),
        })?;
    Url::parse(&host).map_err(|parse_error| FlockError::InvalidHost {
        host: host.to_string(),
        detail: "There was a failure parsing the host.".to_string(),
        parse_error,
    })
}
