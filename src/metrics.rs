//! Optional metrics collected and aggregated during load tests.
//!
//! By default, Flock collects a large number of metrics while performing a load test.
//! When [`Flock::execute()`](../struct.Flock.html#method.execute) completes it returns a
//! [`FlockMetrics`] object.
//!
//! When the [`FlockMetrics`] object is viewed with [`std::fmt::Display`], the
//! contained [`TaskMetrics`], [`RequestMetrics`], [`ErrorMetrics`] and
//! [`UserErrorMetrics`] are displayed in tables.

use chrono::prelude::*;
use http::StatusCode;
use itertools::Itertools;
use num_format::{Locale, ToFormattedString};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::behavior::{FlockMethod, UserBehavior};
use crate::config::FlockConfiguration;
use crate::util;
use crate::{Flock, FlockRunState};

/// Used to send metrics from [`FlockUser`](../behavior/struct.FlockUser.html) tasks
/// to the parent Flock process.
///
/// Users send these metrics to the parent using an
/// [`unbounded Flume channel`](https://docs.rs/flume/*/flume/fn.unbounded.html). The
/// parent aggregates [`RequestMetric`]s into [`RequestMetricAggregate`]s and
/// [`TaskMetric`]s into [`TaskMetricAggregate`]s, so users can spend all their time
/// generating load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FlockMetric {
    Request(RequestMetric),
    Task(TaskMetric),
    Error(ErrorMetric),
    UserError(UserErrorMetric),
}

/// All requests made during a load test.
///
/// Aggregated requests ([`RequestMetricAggregate`]) are stored in a HashMap with the
/// key `method request-name`, for example `GET /api`.
///
/// # Example
/// When viewed with [`std::fmt::Display`], [`RequestMetrics`] are displayed in
/// a table:
/// ```text
/// === PER REQUEST METRICS ===
/// ------------------------------------------------------------------------------
/// Name                     |      # reqs |        # fails |      req/s |   fail/s
/// ------------------------------------------------------------------------------
/// GET /api                 |       1,204 |         0 (0%) |      40.13 |     0.00
/// POST /login              |          10 |     1 (10.0%) |       0.33 |     0.03
/// ------------------------------------------------------------------------------
/// Aggregated               |       1,214 |      1 (0.1%) |      40.47 |     0.03
/// ```
pub type RequestMetrics = HashMap<String, RequestMetricAggregate>;

/// All tasks executed during a load test.
///
/// Aggregated tasks ([`TaskMetricAggregate`]) are stored in a Vector of Vectors,
/// indexed by behavior and then by task, in the order they were registered.
pub type TaskMetrics = Vec<Vec<TaskMetricAggregate>>;

/// All errors detected during a load test.
///
/// Errors are stored in a BTreeMap with the key `error.method.name`.
pub type ErrorMetrics = BTreeMap<String, ErrorMetric>;

/// All users that stopped because their startup hook failed.
pub type UserErrorMetrics = Vec<UserErrorMetric>;

// Round times so similar times are counted together: no rounding below 100 ms, then
// to the nearest 10 below 500 ms, to the nearest 100 below 1000 ms, and to the
// nearest 1000 above.
fn round_time(time: u64) -> usize {
    if time < 100 {
        time as usize
    } else if time < 500 {
        ((time as f64 / 10.0).round() * 10.0) as usize
    } else if time < 1000 {
        ((time as f64 / 100.0).round() * 100.0) as usize
    } else {
        ((time as f64 / 1000.0).round() * 1000.0) as usize
    }
}

/// For tracking and counting requests made during a load test.
///
/// Each request made by a [`FlockUser`](../behavior/struct.FlockUser.html) is
/// described by one `RequestMetric`. It's sent to the parent when metrics are enabled
/// and to the request log when one is configured.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestMetric {
    /// Milliseconds since the load test started.
    pub elapsed: u64,
    pub method: FlockMethod,
    /// The path the task asked for, used to aggregate requests.
    pub name: String,
    pub url: String,
    /// Where the request ended up after following redirects.
    pub final_url: String,
    pub redirected: bool,
    /// Milliseconds until the response arrived.
    pub response_time: u64,
    /// 0 when no response arrived.
    pub status_code: u16,
    pub success: bool,
    /// Index of the user that sent the request.
    pub user: usize,
    /// Empty unless the request failed.
    pub error: String,
}
impl RequestMetric {
    pub(crate) fn new(
        method: FlockMethod,
        name: &str,
        url: &str,
        elapsed: u128,
        user: usize,
    ) -> Self {
        RequestMetric {
            elapsed: elapsed as u64,
            method,
            name: name.to_string(),
            url: url.to_string(),
            final_url: String::new(),
            redirected: false,
            response_time: 0,
            status_code: 0,
            success: true,
            user,
            error: String::new(),
        }
    }

    pub(crate) fn set_final_url(&mut self, final_url: &str) {
        self.redirected = final_url != self.url;
        self.final_url = final_url.to_string();
    }

    pub(crate) fn set_response_time(&mut self, response_time: u128) {
        self.response_time = response_time as u64;
    }

    pub(crate) fn set_status_code(&mut self, status_code: Option<StatusCode>) {
        self.status_code = status_code.map_or(0, |status_code| status_code.as_u16());
    }
}

/// Everything the parent knows about one method and path, such as `GET /api`, kept in
/// [`FlockMetrics::requests`].
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct RequestMetricAggregate {
    pub path: String,
    pub method: FlockMethod,
    /// Histogram of response times, rounded as described for [`round_time`].
    pub response_times: BTreeMap<usize, usize>,
    /// Exact, unlike the histogram. 0 until the first response time.
    pub min_response_time: usize,
    pub max_response_time: usize,
    pub total_response_time: usize,
    pub response_time_counter: usize,
    /// Requests per status code, under 0 when no response arrived.
    pub status_code_counts: HashMap<u16, usize>,
    pub success_count: usize,
    pub fail_count: usize,
}
impl RequestMetricAggregate {
    pub(crate) fn new(path: &str, method: FlockMethod) -> Self {
        trace!("new request");
        RequestMetricAggregate {
            path: path.to_string(),
            method,
            response_times: BTreeMap::new(),
            min_response_time: 0,
            max_response_time: 0,
            total_response_time: 0,
            response_time_counter: 0,
            status_code_counts: HashMap::new(),
            success_count: 0,
            fail_count: 0,
        }
    }

    pub(crate) fn set_response_time(&mut self, response_time: u64) {
        let response_time = response_time as usize;
        // A 0ms response doesn't replace a real minimum.
        if self.min_response_time == 0
            || (response_time > 0 && response_time < self.min_response_time)
        {
            self.min_response_time = response_time;
        }
        self.max_response_time = self.max_response_time.max(response_time);
        self.total_response_time += response_time;
        self.response_time_counter += 1;
        *self
            .response_times
            .entry(round_time(response_time as u64))
            .or_default() += 1;
    }

    pub(crate) fn set_status_code(&mut self, status_code: u16) {
        *self.status_code_counts.entry(status_code).or_default() += 1;
    }
}
impl Ord for RequestMetricAggregate {
    fn cmp(&self, other: &Self) -> Ordering {
        (&self.method, &self.path).cmp(&(&other.method, &other.path))
    }
}
impl PartialOrd for RequestMetricAggregate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Sent by a user after every task it completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMetric {
    /// Milliseconds since the load test started.
    pub elapsed: u64,
    /// Position of the behavior in registration order.
    pub behaviors_index: usize,
    /// Position of the task within its [`UserBehavior`].
    pub task_index: usize,
    pub name: String,
    /// Milliseconds the task took.
    pub run_time: u64,
    pub success: bool,
    pub user: usize,
}
impl TaskMetric {
    pub(crate) fn new(
        elapsed: u128,
        behaviors_index: usize,
        task_index: usize,
        name: String,
        user: usize,
    ) -> Self {
        TaskMetric {
            elapsed: elapsed as u64,
            behaviors_index,
            task_index,
            name,
            run_time: 0,
            success: true,
            user,
        }
    }

    pub(crate) fn set_time(&mut self, time: u128, success: bool) {
        self.run_time = time as u64;
        self.success = success;
    }
}

/// Runs of one task across all users, kept in [`FlockMetrics::tasks`].
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct TaskMetricAggregate {
    pub behaviors_index: usize,
    pub behavior_name: String,
    pub task_index: usize,
    pub task_name: String,
    /// Histogram of run times, rounded like response times.
    pub times: BTreeMap<usize, usize>,
    pub min_time: usize,
    pub max_time: usize,
    pub total_time: usize,
    /// Completed runs, successful or not.
    pub counter: usize,
    pub success_count: usize,
    pub fail_count: usize,
}
impl TaskMetricAggregate {
    pub(crate) fn new(
        behaviors_index: usize,
        behavior_name: &str,
        task_index: usize,
        task_name: &str,
    ) -> Self {
        TaskMetricAggregate {
            behaviors_index,
            behavior_name: behavior_name.to_string(),
            task_index,
            task_name: task_name.to_string(),
            times: BTreeMap::new(),
            min_time: 0,
            max_time: 0,
            total_time: 0,
            counter: 0,
            success_count: 0,
            fail_count: 0,
        }
    }

    /// Count one run of the task that took `time` milliseconds.
    pub(crate) fn set_time(&mut self, time: u64, success: bool) {
        let run_time = time as usize;
        self.min_time = match self.counter {
            0 => run_time,
            _ => self.min_time.min(run_time),
        };
        self.max_time = self.max_time.max(run_time);
        self.total_time += run_time;
        self.counter += 1;
        match success {
            true => self.success_count += 1,
            false => self.fail_count += 1,
        }
        *self.times.entry(round_time(time)).or_default() += 1;
    }
}

/// For tracking and counting errors detected during a load test.
///
/// Errors that share the same method, the same name and the same error text are
/// counted together, with `occurrences` indicating how many times the error was seen.
/// Failed requests carry their method. Tasks that fail without a failed request (a
/// custom error, or a panic) are named after the task and have no method.
///
/// # Example
/// ```text
/// ErrorMetric {
///     method: Some(Get),
///     name: "/api",
///     error: "503 Service Unavailable: /api",
///     occurrences: 4588,
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ErrorMetric {
    /// The method that resulted in an error, if the error came from a request.
    pub method: Option<FlockMethod>,
    /// The request path, or the task name.
    pub name: String,
    /// The error string.
    pub error: String,
    /// A counter reflecting how many times this error occurred.
    pub occurrences: usize,
}
impl ErrorMetric {
    pub(crate) fn new(method: Option<FlockMethod>, name: String, error: String) -> Self {
        ErrorMetric {
            method,
            name,
            error,
            occurrences: 0,
        }
    }

    // The string used to uniquely identify errors.
    fn key(&self) -> String {
        error_key(&self.error, self.method.as_ref(), &self.name)
    }
}

fn error_key(error: &str, method: Option<&FlockMethod>, name: &str) -> String {
    let method = method.map(|m| m.to_string()).unwrap_or_default();
    format!("{}.{}.{}", error, method, name)
}

/// A user that stopped because its startup hook failed.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct UserErrorMetric {
    /// How many milliseconds the load test had been running.
    pub elapsed: u64,
    /// An index into [`Flock`](../struct.Flock.html)`.behaviors`.
    pub behaviors_index: usize,
    /// The behavior name.
    pub behavior_name: String,
    /// Which user stopped.
    pub user: usize,
    /// Why the startup hook failed.
    pub error: String,
}

/// All metrics optionally collected during a Flock load test.
///
/// By default, Flock collects metrics during a load test in a `FlockMetrics` object
/// that is returned by
/// [`Flock::execute()`](../struct.Flock.html#method.execute) when a load test
/// finishes.
///
/// # Example
/// ```rust,no_run
/// use flock::prelude::*;
///
/// fn main() -> Result<(), FlockError> {
///     let flock_metrics: FlockMetrics = Flock::initialize()?
///         .register_behavior(behavior!("ExampleUsers")
///             .register_task(task!(example_task))
///         )
///         // Set a default host so the load test will start.
///         .set_default(FlockDefault::Host, "http://localhost/")?
///         // Set a default run time so this test runs to completion.
///         .set_default(FlockDefault::RunTime, 1)?
///         .execute()?;
///
///     // It is now possible to do something with the metrics collected by Flock.
///     println!("{:#?}", flock_metrics.requests);
///
///     Ok(())
/// }
///
/// async fn example_task(user: &mut FlockUser) -> TaskResult {
///     let _flock = user.get("/").await?;
///
///     Ok(())
/// }
/// ```
#[derive(Clone, Debug, Default)]
pub struct FlockMetrics {
    /// When the load test started.
    pub started: Option<DateTime<Local>>,
    /// When the load test stopped.
    pub stopped: Option<DateTime<Local>>,
    /// Total number of seconds the load test ran, since metrics were last reset.
    pub duration: usize,
    /// Total number of users launched during this load test.
    ///
    /// This value may be smaller than what was configured at start time if the test
    /// didn't run long enough for all configured users to start.
    pub users: usize,
    /// Tracks details about each request made during the load test.
    ///
    /// Can be disabled with the `--no-metrics` run-time option.
    pub requests: RequestMetrics,
    /// Tracks details about each task that is invoked during the load test.
    ///
    /// Can be disabled with either the `--no-task-metrics` or `--no-metrics` run-time
    /// options.
    pub tasks: TaskMetrics,
    /// Tracks and counts each time an error is detected during the load test.
    ///
    /// Can be disabled with either the `--no-error-summary` or `--no-metrics` run-time
    /// options.
    pub errors: ErrorMetrics,
    /// Users that stopped because their startup hook failed.
    pub user_errors: UserErrorMetrics,
    /// Whether or not these are the final metrics.
    pub(crate) final_metrics: bool,
    /// Whether or not to display metrics.
    pub(crate) display_metrics: bool,
}
impl FlockMetrics {
    /// Initialize the task_metrics vector.
    pub(crate) fn initialize_task_metrics(
        &mut self,
        behaviors: &[UserBehavior],
        config: &FlockConfiguration,
    ) {
        self.tasks = Vec::new();
        if !config.no_metrics && !config.no_task_metrics {
            for behavior in behaviors {
                let mut task_vector = Vec::new();
                for task in &behavior.tasks {
                    task_vector.push(TaskMetricAggregate::new(
                        behavior.behaviors_index,
                        &behavior.name,
                        task.tasks_index,
                        &task.name,
                    ));
                }
                self.tasks.push(task_vector);
            }
        }
    }

    /// Display all enabled metrics.
    ///
    /// # Example
    /// ```rust,no_run
    /// use flock::prelude::*;
    ///
    /// fn main() -> Result<(), FlockError> {
    ///     Flock::initialize()?
    ///         .register_behavior(behavior!("ExampleUsers")
    ///             .register_task(task!(example_task))
    ///         )
    ///         .set_default(FlockDefault::Host, "http://localhost/")?
    ///         .set_default(FlockDefault::RunTime, 1)?
    ///         .set_default(FlockDefault::NoPrintMetrics, true)?
    ///         .execute()?
    ///         .print();
    ///
    ///     Ok(())
    /// }
    ///
    /// async fn example_task(user: &mut FlockUser) -> TaskResult {
    ///     let _flock = user.get("/").await?;
    ///
    ///     Ok(())
    /// }
    /// ```
    pub fn print(&self) {
        if self.display_metrics {
            info!("printing final metrics after {} seconds...", self.duration);
            print!("{}", self);
        }
    }

    /// Displays metrics while a load test is running.
    pub(crate) fn print_running(&self) {
        if self.display_metrics {
            info!(
                "printing running metrics after {} seconds...",
                self.duration
            );

            // Include a blank line after printing running metrics.
            println!("{}", self);
        }
    }

    // When the load test started and stopped, only in the final metrics.
    fn fmt_overview(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.final_metrics {
            return Ok(());
        }
        let timestamp = |time: Option<DateTime<Local>>| {
            time.map_or_else(
                || "-".to_string(),
                |time| time.format("%y-%m-%d %H:%M:%S").to_string(),
            )
        };
        writeln!(fmt, "\n === OVERVIEW ===\n{}", RULE)?;
        writeln!(fmt, " {:<24} | {}", "Started", timestamp(self.started))?;
        writeln!(fmt, " {:<24} | {}", "Stopped", timestamp(self.stopped))?;
        writeln!(
            fmt,
            " {:<24} | {} seconds",
            "Duration",
            format_number(self.duration)
        )?;
        writeln!(fmt, " {:<24} | {}", "Users", format_number(self.users))
    }

    // Runs, failures, average time and rate of each task, grouped by behavior.
    fn fmt_tasks(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let task_count: usize = self.tasks.iter().map(Vec::len).sum();
        if task_count == 0 {
            return Ok(());
        }

        fmt_table_header(
            fmt,
            "PER TASK METRICS",
            &format!(
                "{:<24} | {:>11} | {:>14} | {:>10} | {:>8}",
                "Name", "# runs", "# fails", "Avg (ms)", "runs/s"
            ),
        )?;
        let (mut runs, mut fails, mut total_time) = (0, 0, 0);
        for behavior in self.tasks.iter().filter(|tasks| !tasks.is_empty()) {
            writeln!(
                fmt,
                " {}: {}",
                behavior[0].behaviors_index + 1,
                util::truncate_string(&behavior[0].behavior_name, 60)
            )?;
            for task in behavior {
                let name = format!("  {}: {}", task.task_index + 1, task.task_name);
                self.fmt_task_row(fmt, &name, task.counter, task.fail_count, task.total_time)?;
                runs += task.counter;
                fails += task.fail_count;
                total_time += task.total_time;
            }
        }
        if task_count > 1 {
            writeln!(fmt, "{}", RULE)?;
            self.fmt_task_row(fmt, "Aggregated", runs, fails, total_time)?;
        }

        Ok(())
    }

    fn fmt_task_row(
        &self,
        fmt: &mut fmt::Formatter<'_>,
        name: &str,
        runs: usize,
        fails: usize,
        total_time: usize,
    ) -> fmt::Result {
        let average = match runs {
            0 => 0.0,
            _ => total_time as f32 / runs as f32,
        };
        writeln!(
            fmt,
            " {:<24} | {:>11} | {:>14} | {:>10.2} | {:>8.2}",
            util::truncate_string(name, 24),
            format_number(runs),
            format_fails(runs, fails),
            average,
            per_second(self.duration, runs),
        )
    }

    // Requests and failures per endpoint, then their response times.
    fn fmt_requests(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.requests.is_empty() {
            return Ok(());
        }

        fmt_table_header(
            fmt,
            "PER REQUEST METRICS",
            &format!(
                "{:<24} | {:>11} | {:>14} | {:>10} | {:>8}",
                "Name", "# reqs", "# fails", "req/s", "fail/s"
            ),
        )?;
        let (mut total, mut fails) = (0, 0);
        for (request_key, request) in self.requests.iter().sorted_by(|a, b| a.0.cmp(b.0)) {
            let requests = request.success_count + request.fail_count;
            self.fmt_request_row(fmt, request_key, requests, request.fail_count)?;
            total += requests;
            fails += request.fail_count;
        }
        if self.requests.len() > 1 {
            writeln!(fmt, "{}", RULE)?;
            self.fmt_request_row(fmt, "Aggregated", total, fails)?;
        }

        fmt_table_header(
            fmt,
            "",
            &format!(
                "{:<24} | {:>11} | {:>10} | {:>11} | {:>10}",
                "Name", "Avg (ms)", "Min", "Max", "Median"
            ),
        )?;
        let mut aggregate = TimesSummary::default();
        for (request_key, request) in self.requests.iter().sorted_by(|a, b| a.0.cmp(b.0)) {
            let summary = TimesSummary {
                times: request.response_times.clone(),
                total: request.total_response_time,
                counter: request.response_time_counter,
                min: request.min_response_time,
                max: request.max_response_time,
            };
            summary.fmt_row(fmt, request_key)?;
            aggregate.merge(summary);
        }
        if self.requests.len() > 1 {
            writeln!(fmt, "{}", RULE)?;
            aggregate.fmt_row(fmt, "Aggregated")?;
        }

        Ok(())
    }

    fn fmt_request_row(
        &self,
        fmt: &mut fmt::Formatter<'_>,
        name: &str,
        requests: usize,
        fails: usize,
    ) -> fmt::Result {
        writeln!(
            fmt,
            " {:<24} | {:>11} | {:>14} | {:>10.2} | {:>8.2}",
            util::truncate_string(name, 24),
            format_number(requests),
            format_fails(requests, fails),
            per_second(self.duration, requests),
            per_second(self.duration, fails),
        )
    }

    // Distinct errors, most frequent first, only in the final metrics.
    fn fmt_errors(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.final_metrics || self.errors.is_empty() {
            return Ok(());
        }

        fmt_table_header(fmt, "ERRORS", &format!("{:<11} | Error", "Count"))?;
        for error in self
            .errors
            .values()
            .sorted_by(|a, b| b.occurrences.cmp(&a.occurrences))
        {
            let description = match &error.method {
                Some(method) => format!("{} {}: {}", method, error.name, error.error),
                None => format!("{}: {}", error.name, error.error),
            };
            writeln!(
                fmt,
                " {:<11} | {}",
                format_number(error.occurrences),
                description
            )?;
        }
        writeln!(fmt, "{}", RULE)
    }

    // Users stopped by a failed startup hook.
    fn fmt_user_errors(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.user_errors.is_empty() {
            return Ok(());
        }

        fmt_table_header(
            fmt,
            "USER ERRORS",
            &format!("{:<11} | {:<24} | Error", "User", "Behavior"),
        )?;
        for user_error in self.user_errors.iter().sorted_by_key(|e| e.user) {
            writeln!(
                fmt,
                " {:<11} | {:<24} | {}",
                user_error.user,
                util::truncate_string(&user_error.behavior_name, 24),
                user_error.error
            )?;
        }
        writeln!(fmt, "{}", RULE)
    }
}
impl Serialize for FlockMetrics {
    // Serialization can't be derived because of the timestamp fields.
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut s = serializer.serialize_struct("FlockMetrics", 10)?;
        // Convert timestamps to unix timestamps.
        s.serialize_field("started", &self.started.map_or(0, |t| t.timestamp()))?;
        s.serialize_field("stopped", &self.stopped.map_or(0, |t| t.timestamp()))?;
        s.serialize_field("duration", &self.duration)?;
        s.serialize_field("users", &self.users)?;
        s.serialize_field("requests", &self.requests)?;
        s.serialize_field("tasks", &self.tasks)?;
        s.serialize_field("errors", &self.errors)?;
        s.serialize_field("user_errors", &self.user_errors)?;
        s.serialize_field("final_metrics", &self.final_metrics)?;
        s.serialize_field("display_metrics", &self.display_metrics)?;
        s.end()
    }
}

impl fmt::Display for FlockMetrics {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        self.fmt_overview(fmt)?;
        self.fmt_tasks(fmt)?;
        self.fmt_requests(fmt)?;
        self.fmt_errors(fmt)?;
        self.fmt_user_errors(fmt)
    }
}

const RULE: &str =
    " ------------------------------------------------------------------------------";

// A table starts with an optional title, then its column names between two rules.
fn fmt_table_header(fmt: &mut fmt::Formatter<'_>, title: &str, columns: &str) -> fmt::Result {
    if !title.is_empty() {
        writeln!(fmt, "\n === {} ===", title)?;
    }
    writeln!(fmt, "{}\n {}\n{}", RULE, columns, RULE)
}

// Times collected for one row of the response time table.
#[derive(Debug, Default, PartialEq)]
struct TimesSummary {
    times: BTreeMap<usize, usize>,
    total: usize,
    counter: usize,
    min: usize,
    max: usize,
}
impl TimesSummary {
    fn merge(&mut self, other: TimesSummary) {
        for (time, count) in other.times {
            *self.times.entry(time).or_default() += count;
        }
        self.total += other.total;
        // A min of 0 means no times were recorded yet.
        self.min = match (self.min, other.min) {
            (0, min) | (min, 0) => min,
            (a, b) => a.min(b),
        };
        self.max = self.max.max(other.max);
        self.counter += other.counter;
    }

    fn fmt_row(&self, fmt: &mut fmt::Formatter<'_>, name: &str) -> fmt::Result {
        let average = match self.counter {
            0 => 0.0,
            _ => self.total as f32 / self.counter as f32,
        };
        writeln!(
            fmt,
            " {:<24} | {:>11.2} | {:>10} | {:>11} | {:>10}",
            util::truncate_string(name, 24),
            average,
            format_number(self.min),
            format_number(self.max),
            format_number(util::median(&self.times, self.counter, self.min, self.max)),
        )
    }
}

impl Flock {
    // If metrics are enabled, synchronize metrics from user tasks to the parent. If
    // flush is true all metrics will be received regardless of how long it takes. If
    // flush is false, metrics will only be received for up to 400 ms before exiting to
    // continue on the next call to this function.
    pub(crate) fn sync_metrics(&mut self, flock_run_state: &mut FlockRunState, flush: bool) {
        if !self.configuration.no_metrics {
            if let Some(running_metrics) = self.configuration.running_metrics {
                if util::timer_expired(flock_run_state.running_metrics_timer, running_metrics) {
                    flock_run_state.running_metrics_timer = std::time::Instant::now();
                    flock_run_state.display_running_metrics = true;
                }
            }
        }

        // User errors are collected even when metrics are disabled.
        self.receive_metrics(flock_run_state, flush);

        if flock_run_state.display_running_metrics {
            flock_run_state.display_running_metrics = false;
            self.update_duration();
            self.metrics.print_running();
        }
    }

    // When the load test goes from the `Starting` phase to the `Running` phase,
    // optionally reset metrics.
    pub(crate) fn reset_metrics(&mut self, flock_run_state: &mut FlockRunState) {
        if flock_run_state.all_users_spawned {
            return;
        }
        // Receive metrics before resetting them.
        self.sync_metrics(flock_run_state, true);
        flock_run_state.all_users_spawned = true;

        let users = self.configuration.users.unwrap_or(self.metrics.users);
        if self.configuration.no_metrics {
            return;
        }
        if !self.configuration.no_reset_metrics {
            // Display the running metrics collected so far, before resetting them.
            self.update_duration();
            self.metrics.print_running();
            flock_run_state.running_metrics_timer = std::time::Instant::now();

            if self.metrics.display_metrics {
                if self.metrics.users < users {
                    println!(
                        "{} of {} users hatched, timer expired, resetting metrics (disable with --no-reset-metrics).\n",
                        self.metrics.users, users
                    );
                } else {
                    println!(
                        "All {} users hatched, resetting metrics (disable with --no-reset-metrics).\n",
                        users
                    );
                }
            }

            // Errors and user errors are kept.
            self.metrics.requests = HashMap::new();
            self.metrics
                .initialize_task_metrics(&self.behaviors, &self.configuration);
            // Restart the timer now that all users are launched.
            self.started = Some(std::time::Instant::now());
        } else if self.metrics.display_metrics {
            if self.metrics.users < users {
                println!(
                    "{} of {} users hatched, timer expired.\n",
                    self.metrics.users, users
                );
            } else {
                println!("All {} users hatched.\n", self.metrics.users);
            }
        }
    }

    // Merge a `RequestMetric` into a `RequestMetricAggregate` in `FlockMetrics.requests`.
    pub(crate) fn record_request_metric(&mut self, request_metric: &RequestMetric) {
        let key = format!("{} {}", request_metric.method, request_metric.name);
        let merge_request = self.metrics.requests.entry(key).or_insert_with(|| {
            RequestMetricAggregate::new(&request_metric.name, request_metric.method.clone())
        });

        merge_request.set_response_time(request_metric.response_time);
        merge_request.set_status_code(request_metric.status_code);
        if request_metric.success {
            merge_request.success_count += 1;
        } else {
            merge_request.fail_count += 1;
        }
    }

    // Receive metrics from user tasks. Returns true if at least one message was
    // received.
    pub(crate) fn receive_metrics(
        &mut self,
        flock_run_state: &mut FlockRunState,
        flush: bool,
    ) -> bool {
        let mut received_message = false;

        // Main loop wakes up every 500ms, so don't spend more than 400ms receiving metrics.
        let receive_timeout = 400;
        let receive_started = std::time::Instant::now();

        while let Ok(message) = flock_run_state.metrics_rx.try_recv() {
            received_message = true;
            match message {
                FlockMetric::Request(request_metric) => {
                    if !request_metric.error.is_empty() {
                        self.record_error(ErrorMetric {
                            method: Some(request_metric.method.clone()),
                            name: request_metric.name.clone(),
                            error: request_metric.error.clone(),
                            occurrences: 1,
                        });
                    }
                    self.record_request_metric(&request_metric);
                }
                FlockMetric::Error(raw_error) => {
                    self.record_error(raw_error);
                }
                FlockMetric::Task(raw_task) => {
                    match self
                        .metrics
                        .tasks
                        .get_mut(raw_task.behaviors_index)
                        .and_then(|behavior| behavior.get_mut(raw_task.task_index))
                    {
                        Some(task) => task.set_time(raw_task.run_time, raw_task.success),
                        None => debug!(
                            "ignoring metric for untracked task {}:{}",
                            raw_task.behaviors_index, raw_task.task_index
                        ),
                    }
                }
                FlockMetric::UserError(user_error) => {
                    self.metrics.user_errors.push(user_error);
                }
            }
            // Unless flushing all metrics, break out of receive loop after timeout.
            if !flush && util::ms_timer_expired(receive_started, receive_timeout) {
                break;
            }
        }

        received_message
    }

    /// Update error metrics.
    pub(crate) fn record_error(&mut self, raw_error: ErrorMetric) {
        // If the error summary is disabled, return immediately without collecting errors.
        if self.configuration.no_error_summary {
            return;
        }

        let error_metric = self
            .metrics
            .errors
            .entry(raw_error.key())
            .or_insert_with(|| {
                ErrorMetric::new(
                    raw_error.method.clone(),
                    raw_error.name.to_string(),
                    raw_error.error.to_string(),
                )
            });
        error_metric.occurrences += raw_error.occurrences;
    }

    // Update metrics showing how long the load test has been running.
    pub(crate) fn update_duration(&mut self) {
        self.metrics.duration = match self.started {
            Some(started) => started.elapsed().as_secs() as usize,
            None => 0,
        };
    }
}

// How many times something happened per second of the load test.
fn per_second(duration: usize, count: usize) -> f32 {
    match duration {
        0 => 0.0,
        _ => count as f32 / duration as f32,
    }
}

// Failures with their share of all attempts, "3 (12.5%)", or "0 (0%)" without decimals
// when the share is whole.
fn format_fails(total: usize, fails: usize) -> String {
    let percent = match total {
        0 => 0.0,
        _ => fails as f32 * 100.0 / total as f32,
    };
    if percent.fract() == 0.0 {
        format!("{} ({}%)", format_number(fails), percent as usize)
    } else {
        format!("{} ({:.1}%)", format_number(fails), percent)
    }
}

/// Format large number in locale appropriate style.
pub(crate) fn format_number(number: usize) -> String {
    number.to_formatted_string(&Locale::en)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn times_summary_merge() {
        let mut aggregate = TimesSummary::default();
        aggregate.merge(TimesSummary {
            times: BTreeMap::from([(5, 2)]),
            total: 10,
            counter: 2,
            min: 5,
            max: 5,
        });
        aggregate.merge(TimesSummary {
            times: BTreeMap::from([(5, 3), (120, 1)]),
            total: 136,
            counter: 4,
            min: 4,
            max: 122,
        });
        // Rows without requests don't lower the minimum.
        aggregate.merge(TimesSummary::default());
        assert_eq!(
            aggregate,
            TimesSummary {
                times: BTreeMap::from([(5, 5), (120, 1)]),
                total: 146,
                counter: 6,
                min: 4,
                max: 122,
            }
        );
    }

    #[test]
    fn rounding() {
        assert_eq!(round_time(0), 0);
        assert_eq!(round_time(99), 99);
        assert_eq!(round_time(104), 100);
        assert_eq!(round_time(105), 110);
        assert_eq!(round_time(499), 500);
        assert_eq!(round_time(549), 500);
        assert_eq!(round_time(951), 1000);
        assert_eq!(round_time(1499), 1000);
        assert_eq!(round_time(2500), 3000);
    }

    #[test]
    fn rates_and_fails() {
        // Nothing is per second before the first second.
        assert_eq!(per_second(0, 100), 0.0);
        assert!((per_second(10, 100) - 10.0).abs() < f32::EPSILON);
        assert!((per_second(8, 1) - 0.125).abs() < f32::EPSILON);

        assert_eq!(format_fails(0, 0), "0 (0%)");
        assert_eq!(format_fails(1_500, 1_500), "1,500 (100%)");
        assert_eq!(format_fails(8, 1), "1 (12.5%)");
    }

    #[test]
    fn raw_request() {
        const PATH: &str = "http://127.0.0.1/api";
        let mut raw_request = RequestMetric::new(FlockMethod::Get, "/api", PATH, 0, 0);
        assert_eq!(raw_request.method, FlockMethod::Get);
        assert_eq!(raw_request.name, "/api".to_string());
        assert_eq!(raw_request.url, PATH.to_string());
        assert_eq!(raw_request.response_time, 0);
        assert_eq!(raw_request.status_code, 0);
        assert!(raw_request.success);

        raw_request.set_response_time(123);
        assert_eq!(raw_request.response_time, 123);

        raw_request.set_status_code(Some(http::StatusCode::OK));
        assert_eq!(raw_request.status_code, 200);
        raw_request.set_status_code(None);
        assert_eq!(raw_request.status_code, 0);

        raw_request.set_final_url(PATH);
        assert!(!raw_request.redirected);
        raw_request.set_final_url("http://127.0.0.1/elsewhere");
        assert!(raw_request.redirected);
    }

    #[test]
    fn request_aggregate() {
        let mut request = RequestMetricAggregate::new("/api", FlockMethod::Get);
        assert_eq!(request.response_times.len(), 0);
        assert_eq!(request.min_response_time, 0);
        assert_eq!(request.max_response_time, 0);

        request.set_response_time(1);
        assert_eq!(request.response_times[&1], 1);
        assert_eq!(request.min_response_time, 1);
        assert_eq!(request.max_response_time, 1);
        assert_eq!(request.total_response_time, 1);
        assert_eq!(request.response_time_counter, 1);

        // Rounded times are counted together, but min and max are exact.
        request.set_response_time(123);
        request.set_response_time(118);
        assert_eq!(request.response_times[&120], 2);
        assert_eq!(request.min_response_time, 1);
        assert_eq!(request.max_response_time, 123);
        assert_eq!(request.total_response_time, 242);
        assert_eq!(request.response_time_counter, 3);

        request.set_status_code(200);
        request.set_status_code(200);
        request.set_status_code(503);
        assert_eq!(request.status_code_counts[&200], 2);
        assert_eq!(request.status_code_counts[&503], 1);
    }

    #[test]
    fn task_aggregate() {
        let mut task = TaskMetricAggregate::new(0, "WebsiteUser", 0, "api");
        task.set_time(12, true);
        task.set_time(730, false);
        assert_eq!(task.counter, 2);
        assert_eq!(task.success_count, 1);
        assert_eq!(task.fail_count, 1);
        assert_eq!(task.min_time, 12);
        assert_eq!(task.max_time, 730);
        assert_eq!(task.times[&12], 1);
        assert_eq!(task.times[&700], 1);

        // Run times are exact, a task can take under a millisecond.
        task.set_time(0, true);
        assert_eq!(task.min_time, 0);
        assert_eq!(task.counter, 3);
    }

    #[test]
    fn display() {
        let mut metrics = FlockMetrics {
            duration: 10,
            users: 2,
            display_metrics: true,
            ..Default::default()
        };
        let mut request = RequestMetricAggregate::new("/api", FlockMethod::Get);
        for _ in 0..1_200 {
            request.set_response_time(5);
            request.set_status_code(200);
            request.success_count += 1;
        }
        request.set_response_time(50);
        request.set_status_code(503);
        request.fail_count += 1;
        metrics.requests.insert("GET /api".to_string(), request);
        let mut task = TaskMetricAggregate::new(0, "WebsiteUser", 0, "api");
        task.set_time(6, true);
        metrics.tasks.push(vec![task]);
        metrics.errors.insert(
            error_key("503 Service Unavailable: /api", Some(&FlockMethod::Get), "/api"),
            ErrorMetric {
                method: Some(FlockMethod::Get),
                name: "/api".to_string(),
                error: "503 Service Unavailable: /api".to_string(),
                occurrences: 1,
            },
        );

        // Running metrics don't include the final-only tables.
        let running = metrics.to_string();
        assert!(running.contains("=== PER TASK METRICS ==="));
        assert!(running.contains("=== PER REQUEST METRICS ==="));
        assert!(running.contains("1,201"));
        assert!(running.contains("1 (0.1%)"));
        assert!(running.contains("Avg (ms)"));
        // A single task has no aggregated row.
        assert!(!running.contains("Aggregated"));
        assert!(!running.contains("=== ERRORS ==="));
        assert!(!running.contains("=== OVERVIEW ==="));

        metrics.final_metrics = true;
        metrics.user_errors.push(UserErrorMetric {
            elapsed: 3,
            behaviors_index: 0,
            behavior_name: "WebsiteUser".to_string(),
            user: 1,
            error: "login failed".to_string(),
        });
        let final_metrics = metrics.to_string();
        assert!(final_metrics.contains("=== OVERVIEW ==="));
        assert!(final_metrics.contains("GET /api: 503 Service Unavailable: /api"));
        assert!(final_metrics.contains("=== USER ERRORS ==="));
        assert!(final_metrics.contains("login failed"));

        // Metrics serialize to json.
        let json = serde_json::to_value(&metrics).unwrap();
        assert_eq!(json["users"], 2);
        assert_eq!(json["requests"]["GET /api"]["fail_count"], 1);
    }
}
