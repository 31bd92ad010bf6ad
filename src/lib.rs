//! # Flock
//!
//! Flock is a load testing framework. A load test registers one or more
//! [`UserBehavior`](./behavior/struct.UserBehavior.html)s, and Flock launches simulated
//! users that each follow one of them: an optional startup hook runs once, then the
//! user repeatedly picks a task at random according to task weights, runs it, and
//! sleeps a random time before picking the next one.
//!
//! ## Creating a load test
//!
//! A load test is a Rust application that depends on Flock:
//!
//! ```bash
//! cargo new loadtest
//! ```
//!
//! Add Flock to the new app's `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! flock = "0.1"
//! ```
//!
//! ### Defining tasks
//!
//! Tasks are async functions that receive a [`FlockUser`](./behavior/struct.FlockUser.html),
//! the handle a simulated user makes requests through. Each request is timed and
//! recorded. A request that fails, or returns a non-2xx status code, fails the task.
//!
//! ```rust
//! use flock::prelude::*;
//!
//! async fn api(user: &mut FlockUser) -> TaskResult {
//!     let _flock = user.get("/api").await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! ### Running the load test
//!
//! A [`UserBehavior`](./behavior/struct.UserBehavior.html) groups weighted tasks, an
//! optional startup hook and the range of time to wait between tasks:
//!
//! ```rust,no_run
//! use flock::prelude::*;
//! use std::time::Duration;
//!
//! fn main() -> Result<(), FlockError> {
//!     Flock::initialize()?
//!         .register_behavior(behavior!("WebsiteUser")
//!             .register_task(task!(api).set_weight(5))
//!             .set_wait_time(Duration::from_millis(5), Duration::from_millis(500))?
//!         )
//!         .execute()?;
//!
//!     Ok(())
//! }
//!
//! async fn api(user: &mut FlockUser) -> TaskResult {
//!     let _flock = user.get("/api").await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! Run-time options are listed with `cargo run -- -h`. A host is required, for example:
//!
//! ```bash
//! cargo run --release -- --host http://local.dev -u 8 -r 2 -t 5m
//! ```
//!
//! This launches 8 users, 2 per second, runs for 5 minutes once all users are
//! launched, and then prints a summary of all requests, tasks and errors. Pressing
//! ctrl-c stops the load test early and still prints the summary.

#[macro_use]
extern crate log;

pub mod behavior;
pub mod config;
pub mod logger;
pub mod metrics;
pub mod prelude;
pub mod sampler;
mod user;
pub mod util;

use chrono::prelude::*;
use gumdrop::Options;
use std::sync::atomic::{AtomicBool, Ordering};
use std::{fmt, io, time};
use tokio::runtime::Runtime;

use crate::behavior::{FlockUser, UserBehavior, UserCommand};
use crate::config::{FlockConfiguration, FlockDefaults};
use crate::metrics::{FlockMetric, FlockMetrics};
use crate::sampler::WeightedSampler;

/// Set by the ctrl-c handler, stops a running load test.
pub(crate) static CANCELED: AtomicBool = AtomicBool::new(false);

/// Errors returned while configuring or running a [`Flock`](./struct.Flock.html) load test.
#[derive(Debug)]
pub enum FlockError {
    /// Reading or writing a file failed.
    Io(io::Error),
    /// Building the HTTP client failed.
    Reqwest(reqwest::Error),
    /// A user or the request logger panicked.
    TokioJoin(tokio::task::JoinError),
    /// A host that isn't an absolute URL.
    InvalidHost {
        host: String,
        detail: String,
        parse_error: url::ParseError,
    },
    /// An option is invalid on its own, or in combination with another option.
    InvalidOption {
        option: String,
        value: String,
        detail: String,
    },
    /// A wait range whose minimum is above its maximum, in milliseconds.
    InvalidWaitTime {
        min_wait: usize,
        max_wait: usize,
        detail: String,
    },
    /// Task weights that can't be sampled from.
    InvalidWeight { weight: usize, detail: String },
    /// `execute()` was called before any
    /// [`UserBehavior`](./behavior/struct.UserBehavior.html) was registered.
    NoBehaviors { detail: String },
}
impl FlockError {
    fn describe(&self) -> &str {
        match self {
            FlockError::Io(_) => "io::Error",
            FlockError::Reqwest(_) => "reqwest::Error",
            FlockError::TokioJoin(_) => "tokio::task::JoinError",
            FlockError::InvalidHost { .. } => "failed to parse hostname",
            FlockError::InvalidOption { .. } => "invalid option or value specified",
            FlockError::InvalidWaitTime { .. } => "invalid wait_time specified",
            FlockError::InvalidWeight { .. } => "invalid weight specified",
            FlockError::NoBehaviors { .. } => "no behaviors registered",
        }
    }
}

impl fmt::Display for FlockError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let cause: &dyn fmt::Display = match self {
            FlockError::Io(source) => source,
            FlockError::Reqwest(source) => source,
            FlockError::TokioJoin(source) => source,
            FlockError::InvalidHost { parse_error, .. } => parse_error,
            FlockError::InvalidOption { detail, .. }
            | FlockError::InvalidWaitTime { detail, .. }
            | FlockError::InvalidWeight { detail, .. }
            | FlockError::NoBehaviors { detail } => detail,
        };
        write!(f, "FlockError: {} ({})", self.describe(), cause)
    }
}

impl std::error::Error for FlockError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FlockError::Io(source) => Some(source),
            FlockError::Reqwest(source) => Some(source),
            FlockError::TokioJoin(source) => Some(source),
            FlockError::InvalidHost { parse_error, .. } => Some(parse_error),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for FlockError {
    fn from(err: reqwest::Error) -> FlockError {
        FlockError::Reqwest(err)
    }
}

impl From<io::Error> for FlockError {
    fn from(err: io::Error) -> FlockError {
        FlockError::Io(err)
    }
}

impl From<tokio::task::JoinError> for FlockError {
    fn from(err: tokio::task::JoinError) -> FlockError {
        FlockError::TokioJoin(err)
    }
}

/// The phases a [`Flock`](./struct.Flock.html) load test moves through, in order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AttackPhase {
    Idle,
    /// Users are launching at the hatch rate.
    Starting,
    /// Every user has launched, the run time is counting down.
    Running,
    /// Users have been told to exit and are being joined.
    Stopping,
    Shutdown,
}

// State of one run of `execute()`, owned by the control loop.
#[derive(Debug)]
pub(crate) struct FlockRunState {
    // When the previous user launched.
    spawn_user_timer: std::time::Instant,
    // Milliseconds between two user launches.
    spawn_user_in_ms: usize,
    // Index of the next user to launch.
    spawn_user_counter: usize,
    // Subtracted from the next launch sleep.
    drift_timer: tokio::time::Instant,
    // Cloned into every user.
    all_threads_metrics_tx: flume::Sender<FlockMetric>,
    pub(crate) metrics_rx: flume::Receiver<FlockMetric>,
    logger_handle: Option<tokio::task::JoinHandle<Result<(), FlockError>>>,
    // Cloned into every user when a request log is written.
    all_threads_logger_tx: Option<flume::Sender<Option<metrics::RequestMetric>>>,
    users: Vec<tokio::task::JoinHandle<()>>,
    // Parallel to `users`.
    user_channels: Vec<flume::Sender<UserCommand>>,
    pub(crate) running_metrics_timer: std::time::Instant,
    pub(crate) display_running_metrics: bool,
    pub(crate) all_users_spawned: bool,
}

/// A load test: registered behaviors, their configuration, and the metrics of the run.
pub struct Flock {
    behaviors: Vec<UserBehavior>,
    // One entry per user, assigned round robin across behaviors by weight.
    weighted_users: Vec<FlockUser>,
    defaults: FlockDefaults,
    configuration: FlockConfiguration,
    // Seconds, 0 runs until canceled.
    run_time: usize,
    attack_phase: AttackPhase,
    started: Option<time::Instant>,
    metrics: FlockMetrics,
}
impl Flock {
    /// Load configuration from the command line and initialize a
    /// [`Flock`](./struct.Flock.html).
    ///
    /// # Example
    /// ```rust,no_run
    /// use flock::prelude::*;
    ///
    /// let mut flock = Flock::initialize();
    /// ```
    pub fn initialize() -> Result<Flock, FlockError> {
        Flock::initialize_with_config(FlockConfiguration::parse_args_default_or_exit())
    }

    /// Initialize a [`Flock`](./struct.Flock.html) with an already loaded
    /// configuration.
    ///
    /// This is generally used by tests.
    ///
    /// # Example
    /// ```rust
    /// use flock::Flock;
    /// use flock::config::FlockConfiguration;
    /// use gumdrop::Options;
    ///
    /// let configuration = FlockConfiguration::parse_args_default(&["--host", "http://local.dev"]).unwrap();
    /// let mut flock = Flock::initialize_with_config(configuration);
    /// ```
    pub fn initialize_with_config(configuration: FlockConfiguration) -> Result<Flock, FlockError> {
        Ok(Flock {
            behaviors: Vec::new(),
            weighted_users: Vec::new(),
            defaults: FlockDefaults::default(),
            configuration,
            run_time: 0,
            attack_phase: AttackPhase::Idle,
            started: None,
            metrics: FlockMetrics::default(),
        })
    }

    /// A load test must contain one or more
    /// [`UserBehavior`](./behavior/struct.UserBehavior.html)s. Each behavior must
    /// contain one or more [`Task`](./behavior/struct.Task.html)s with a combined weight
    /// larger than 0.
    ///
    /// # Example
    /// ```rust
    /// use flock::prelude::*;
    ///
    /// fn main() -> Result<(), FlockError> {
    ///     Flock::initialize_with_config(FlockConfiguration::default())?
    ///         .register_behavior(behavior!("ExampleUsers")
    ///             .register_task(task!(example_task))
    ///         )
    ///         .register_behavior(behavior!("OtherUsers")
    ///             .register_task(task!(other_task))
    ///         );
    ///
    ///     Ok(())
    /// }
    ///
    /// async fn example_task(user: &mut FlockUser) -> TaskResult {
    ///     let _flock = user.get("/foo").await?;
    ///
    ///     Ok(())
    /// }
    ///
    /// async fn other_task(user: &mut FlockUser) -> TaskResult {
    ///     let _flock = user.get("/bar").await?;
    ///
    ///     Ok(())
    /// }
    /// ```
    pub fn register_behavior(mut self, mut behavior: UserBehavior) -> Self {
        behavior.behaviors_index = self.behaviors.len();
        self.behaviors.push(behavior);
        self
    }

    /// Allocate behaviors to users round robin by weight, after reducing all weights by
    /// their greatest common divisor. For example, if behavior A has a weight of 5 and
    /// behavior B has a weight of 3, users are allocated in the following repeating
    /// order: A, B, A, B, A, B, A, A
    fn allocate_behaviors(&self) -> Vec<usize> {
        trace!("allocate_behaviors");

        let mut u: usize = 0;
        for behavior in &self.behaviors {
            if u == 0 {
                u = behavior.weight;
            } else {
                trace!(
                    "calculating greatest common divisor of {} and {}",
                    u,
                    behavior.weight
                );
                u = util::gcd(u, behavior.weight);
            }
        }
        // 'u' will always be the greatest common divisor
        debug!("gcd: {}", u);

        // Build a vector of vectors to be used to schedule users.
        let mut available_behaviors = Vec::with_capacity(self.behaviors.len());
        let mut total_behaviors = 0;
        for (index, behavior) in self.behaviors.iter().enumerate() {
            // Divide by greatest common divisor so vector is as short as possible.
            let weight = behavior.weight / u;
            trace!(
                "{}: {} has weight of {} (reduced with gcd to {})",
                index,
                behavior.name,
                behavior.weight,
                weight
            );
            available_behaviors.push(vec![index; weight]);
            total_behaviors += weight;
        }

        // Allocate behaviors round robin.
        let mut weighted_behaviors = Vec::with_capacity(total_behaviors);
        while weighted_behaviors.len() < total_behaviors {
            for (behavior_index, behaviors) in available_behaviors.iter_mut().enumerate() {
                if let Some(behavior) = behaviors.pop() {
                    debug!("allocating 1 user from UserBehavior {}", behavior_index);
                    weighted_behaviors.push(behavior);
                }
            }
        }
        weighted_behaviors
    }

    /// Allocate a vector of weighted [`FlockUser`](./behavior/struct.FlockUser.html)s,
    /// in the order they are launched.
    fn weight_behavior_users(&self) -> Result<Vec<FlockUser>, FlockError> {
        trace!("weight_behavior_users");

        let users = self.configuration.users.unwrap_or(1);
        let weighted_behaviors = self.allocate_behaviors();

        // Allocate a state for each user that will be hatched.
        info!("initializing user states...");
        let mut weighted_users = Vec::with_capacity(users);
        for behaviors_index in weighted_behaviors.iter().cycle().take(users) {
            debug!(
                "creating user state: {} ({})",
                weighted_users.len(),
                behaviors_index
            );
            let behavior = &self.behaviors[*behaviors_index];
            let base_url = behavior::get_base_url(
                self.get_configuration_host(),
                behavior.host.clone(),
                self.defaults.host.clone(),
            )?;
            weighted_users.push(FlockUser::new(
                behavior.behaviors_index,
                base_url,
                &self.configuration,
            )?);
        }
        debug!("created {} weighted_users", weighted_users.len());
        Ok(weighted_users)
    }

    fn set_attack_phase(&mut self, flock_run_state: &mut FlockRunState, phase: AttackPhase) {
        // There's nothing to do if already in the specified phase.
        if self.attack_phase == phase {
            return;
        }

        // The drift timer starts at 0 any time the phase is changed.
        flock_run_state.drift_timer = tokio::time::Instant::now();

        info!("entering Flock phase: {:?}", &phase);
        self.attack_phase = phase;
    }

    /// Execute the [`Flock`](./struct.Flock.html) load test, blocking until it
    /// finishes. Returns the collected [`FlockMetrics`](./metrics/struct.FlockMetrics.html).
    ///
    /// # Example
    /// ```rust,no_run
    /// use flock::prelude::*;
    ///
    /// fn main() -> Result<(), FlockError> {
    ///     let _flock_metrics = Flock::initialize()?
    ///         .register_behavior(behavior!("ExampleUsers")
    ///             .register_task(task!(example_task).set_weight(2))
    ///             .register_task(task!(another_example_task).set_weight(3))
    ///             // Flock must run against a host, point to localhost so test starts.
    ///             .set_host("http://localhost")
    ///         )
    ///         // Exit after one second so test doesn't run forever.
    ///         .set_default(FlockDefault::RunTime, 1)?
    ///         .execute()?;
    ///
    ///     Ok(())
    /// }
    ///
    /// async fn example_task(user: &mut FlockUser) -> TaskResult {
    ///     let _flock = user.get("/foo").await?;
    ///
    ///     Ok(())
    /// }
    ///
    /// async fn another_example_task(user: &mut FlockUser) -> TaskResult {
    ///     let _flock = user.get("/bar").await?;
    ///
    ///     Ok(())
    /// }
    /// ```
    pub fn execute(mut self) -> Result<FlockMetrics, FlockError> {
        // If version flag is set, display package name and version and exit.
        if self.configuration.version {
            println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
            std::process::exit(0);
        }

        // At least one behavior is required.
        if self.behaviors.is_empty() {
            return Err(FlockError::NoBehaviors {
                detail: "No behaviors are registered.".to_string(),
            });
        }

        // Display behaviors and tasks, then exit.
        if self.configuration.list {
            println!("Available behaviors:");
            for behavior in &self.behaviors {
                println!(" - {} (weight: {})", behavior.name, behavior.weight);
                if let Some(on_start) = behavior.on_start.as_ref() {
                    println!("    o {} (on_start)", on_start.name);
                }
                for task in &behavior.tasks {
                    println!("    o {} (weight: {})", task.name, task.weight);
                }
            }
            std::process::exit(0);
        }

        // Configure FlockConfiguration.
        self.configuration.configure(&self.defaults);

        // Validate FlockConfiguration.
        self.configuration.validate()?;

        // Configure the validated run time.
        self.run_time = util::parse_timespan(&self.configuration.run_time);

        self.prepare_load_test()?;

        let rt = Runtime::new()?;
        self = rt.block_on(self.start_attack())?;

        Ok(self.metrics)
    }

    // Validate all behaviors and create the users that will be launched.
    fn prepare_load_test(&mut self) -> Result<(), FlockError> {
        for behavior in &self.behaviors {
            // A behavior needs a valid host.
            let base_url = behavior::get_base_url(
                self.get_configuration_host(),
                behavior.host.clone(),
                self.defaults.host.clone(),
            )
            .map_err(|e| match e {
                FlockError::InvalidOption {
                    option,
                    value,
                    detail,
                } => FlockError::InvalidOption {
                    option,
                    value,
                    detail: format!("{} (no host defined for {})", detail, behavior.name),
                },
                e => e,
            })?;
            info!("host for {} configured: {}", behavior.name, base_url);

            // A behavior needs a positive total task weight.
            let sampler: WeightedSampler = behavior.sampler()?;
            debug!(
                "{} has {} tasks with a total weight of {}",
                behavior.name,
                behavior.tasks.len(),
                sampler.total_weight()
            );
        }

        // Allocate a state for each of the users we are about to start. Users are
        // popped from the end of the vector as they launch.
        self.weighted_users = self.weight_behavior_users()?;
        self.weighted_users.reverse();

        Ok(())
    }

    /// Helper to wrap configured host in `Option<>` if set.
    fn get_configuration_host(&self) -> Option<String> {
        if self.configuration.host.is_empty() {
            None
        } else {
            Some(self.configuration.host.to_string())
        }
    }

    // Prepare the run state, the request logger, and the ctrl-c handler.
    async fn initialize_attack(&mut self) -> Result<FlockRunState, FlockError> {
        trace!("initialize_attack");

        // Create a single channel used to send metrics from FlockUser threads
        // to parent thread.
        let (all_threads_metrics_tx, metrics_rx): (
            flume::Sender<FlockMetric>,
            flume::Receiver<FlockMetric>,
        ) = flume::unbounded();

        // If enabled, spawn a logger thread.
        let (logger_handle, all_threads_logger_tx) =
            self.configuration.setup_request_logger().await?;

        // Prepare to collect metrics, if enabled.
        self.metrics = FlockMetrics::default();
        self.metrics
            .initialize_task_metrics(&self.behaviors, &self.configuration);
        self.metrics.display_metrics = !self.configuration.no_metrics;

        // Grab now() once from the standard library, used by multiple timers in
        // the run state.
        let std_now = std::time::Instant::now();

        let flock_run_state = FlockRunState {
            spawn_user_timer: std_now,
            spawn_user_in_ms: 0,
            spawn_user_counter: 0,
            drift_timer: tokio::time::Instant::now(),
            all_threads_metrics_tx,
            metrics_rx,
            logger_handle,
            all_threads_logger_tx,
            users: Vec::new(),
            user_channels: Vec::new(),
            running_metrics_timer: std_now,
            display_running_metrics: false,
            all_users_spawned: false,
        };

        // Catch ctrl-c to allow clean shutdown to display metrics.
        util::setup_ctrlc_handler();

        // Record when the load test officially started.
        self.started = Some(std_now);
        self.metrics.started = Some(Local::now());

        Ok(flock_run_state)
    }

    // Returns true once the configured run time has elapsed.
    fn run_time_expired(&self) -> bool {
        self.started
            .map(|started| util::timer_expired(started, self.run_time))
            .unwrap_or(false)
    }

    // Spawn [`FlockUser`](./behavior/struct.FlockUser.html) threads at the configured
    // hatch rate.
    async fn spawn_attack(&mut self, flock_run_state: &mut FlockRunState) -> Result<(), FlockError> {
        // The run time can expire before all users are launched.
        if self.run_time_expired() {
            info!("run time expired while launching users...");
            self.reset_metrics(flock_run_state);
            self.set_attack_phase(flock_run_state, AttackPhase::Stopping);
            return Ok(());
        }

        let hatch_rate = util::parse_float(self.configuration.hatch_rate.as_deref()).unwrap_or(1.0);

        // Determine if it's time to spawn a FlockUser.
        if flock_run_state.spawn_user_in_ms == 0
            || util::ms_timer_expired(
                flock_run_state.spawn_user_timer,
                flock_run_state.spawn_user_in_ms,
            )
        {
            if let Some(mut thread_user) = self.weighted_users.pop() {
                // Reset the spawn timer.
                flock_run_state.spawn_user_timer = std::time::Instant::now();

                // To determine how long before we spawn the next FlockUser, start with
                // 1,000.0 milliseconds and divide by the hatch_rate.
                flock_run_state.spawn_user_in_ms = (1_000.0 / hatch_rate) as usize;
                flock_run_state.spawn_user_counter += 1;

                // Remember which user this is.
                thread_user.weighted_users_index = self.metrics.users;

                // Create a per-thread channel allowing parent thread to control child threads.
                let (parent_sender, thread_receiver): (
                    flume::Sender<UserCommand>,
                    flume::Receiver<UserCommand>,
                ) = flume::unbounded();
                flock_run_state.user_channels.push(parent_sender);

                // Clone the logger_tx if enabled, otherwise is None.
                thread_user.logger = flock_run_state.all_threads_logger_tx.clone();

                // Copy the FlockUser-to-parent sender channel, used by all threads.
                thread_user.channel_to_parent = Some(flock_run_state.all_threads_metrics_tx.clone());

                // Copy the appropriate behavior into the thread.
                let thread_behavior = self.behaviors[thread_user.behaviors_index].clone();

                // We number threads from 1 as they're human-visible (in the logs),
                // whereas metrics.users starts at 0.
                let thread_number = self.metrics.users + 1;

                // Launch a new user.
                let user = tokio::spawn(user::user_main(
                    thread_number,
                    thread_behavior,
                    thread_user,
                    thread_receiver,
                ));

                flock_run_state.users.push(user);
                self.metrics.users += 1;
                debug!(
                    "spawned user {} of {}",
                    flock_run_state.spawn_user_counter,
                    self.configuration.users.unwrap_or(0)
                );
            }
        } else {
            // Sleep until the next user is due, waking at least twice per second to
            // notice ctrl-c and to synchronize metrics.
            let remaining = flock_run_state.spawn_user_in_ms.saturating_sub(
                flock_run_state.spawn_user_timer.elapsed().as_millis() as usize,
            );
            let sleep_duration = time::Duration::from_millis(remaining.min(500) as u64);
            debug!("sleeping {:?}...", sleep_duration);
            flock_run_state.drift_timer =
                util::sleep_minus_drift(sleep_duration, flock_run_state.drift_timer).await;
        }

        // If enough users have been spawned, move onto the next attack phase.
        if self.weighted_users.is_empty() {
            // Pause a tenth of a second waiting for the final user to fully start up.
            tokio::time::sleep(time::Duration::from_millis(100)).await;

            info!("launched {} users...", self.metrics.users);

            self.reset_metrics(flock_run_state);
            if !self.configuration.no_reset_metrics {
                self.metrics.started = Some(Local::now());
            }
            self.set_attack_phase(flock_run_state, AttackPhase::Running);
        }

        Ok(())
    }

    // Let the [`Flock`](./struct.Flock.html) run until the timer expires (or the test
    // is canceled), and then trigger a shut down.
    async fn monitor_attack(&mut self, flock_run_state: &mut FlockRunState) {
        // Exit if run_time timer expires.
        if self.run_time_expired() {
            self.set_attack_phase(flock_run_state, AttackPhase::Stopping);
        } else {
            // Subtract the time spent doing other things, running the main parent loop twice
            // per second.
            flock_run_state.drift_timer = util::sleep_minus_drift(
                time::Duration::from_millis(500),
                flock_run_state.drift_timer,
            )
            .await;
        }
    }

    // Tell all users to exit, wait for them, then close the request log and collect
    // the remaining metrics.
    async fn stop_running_users(
        &mut self,
        flock_run_state: &mut FlockRunState,
    ) -> Result<(), FlockError> {
        info!("stopping after {} seconds...", self.metrics.duration);
        for (index, send_to_user) in flock_run_state.user_channels.iter().enumerate() {
            match send_to_user.send(UserCommand::Exit) {
                Ok(_) => {
                    debug!("telling user {} to exit", index);
                }
                Err(e) => {
                    // The user already exited, for example after a failed startup hook.
                    debug!("failed to tell user {} to exit: {}", index, e);
                }
            }
        }
        info!("waiting for users to exit");

        // Take the users vector out of the FlockRunState object so it can be
        // consumed by futures::future::join_all().
        let users = std::mem::take(&mut flock_run_state.users);
        for result in futures::future::join_all(users).await {
            if let Err(e) = result {
                warn!("user exited unexpectedly: {}", e);
            }
        }
        flock_run_state.user_channels.clear();
        debug!("all users exited");

        // If the logger thread is enabled, tell it to flush and exit.
        if let Some(logger_tx) = flock_run_state.all_threads_logger_tx.take() {
            if let Err(e) = logger_tx.send(None) {
                warn!("unexpected error telling logger thread to exit: {}", e);
            }
        }
        if let Some(logger) = flock_run_state.logger_handle.take() {
            logger.await??;
        }

        // Collect the final metrics received from users, waiting until all metrics are
        // received.
        self.sync_metrics(flock_run_state, true);

        Ok(())
    }

    // The parent loop runs until the load test shuts down. It enters the loop in
    // AttackPhase::Idle, and exits in AttackPhase::Shutdown.
    async fn start_attack(mut self) -> Result<Flock, FlockError> {
        trace!("start_attack");

        let mut flock_run_state = self.initialize_attack().await?;

        loop {
            match self.attack_phase {
                AttackPhase::Idle => {
                    self.set_attack_phase(&mut flock_run_state, AttackPhase::Starting);
                }
                // Launch FlockUser threads.
                AttackPhase::Starting => {
                    self.update_duration();
                    self.spawn_attack(&mut flock_run_state).await?;
                }
                // Maintain the configured load until the run time expires.
                AttackPhase::Running => {
                    self.update_duration();
                    self.monitor_attack(&mut flock_run_state).await;
                }
                // Stop all FlockUser threads and prepare the final metrics.
                AttackPhase::Stopping => {
                    self.update_duration();
                    self.stop_running_users(&mut flock_run_state).await?;
                    // Errors are only displayed when the load test is finished.
                    self.metrics.final_metrics = true;
                    self.metrics.stopped = Some(Local::now());
                    self.set_attack_phase(&mut flock_run_state, AttackPhase::Shutdown);
                }
                AttackPhase::Shutdown => break,
            }

            // Regularly synchronize metrics.
            self.sync_metrics(&mut flock_run_state, false);

            // Gracefully exit loop if ctrl-c is caught.
            if matches!(
                self.attack_phase,
                AttackPhase::Starting | AttackPhase::Running
            ) && CANCELED.load(Ordering::SeqCst)
            {
                self.set_attack_phase(&mut flock_run_state, AttackPhase::Stopping);
            }
        }

        if !self.configuration.no_print_metrics {
            self.metrics.print();
        }

        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::behavior::TaskResult;
    use crate::config::{FlockDefault, FlockDefaultType};
    use crate::task;
    use std::error::Error;

    async fn noop(_user: &mut FlockUser) -> TaskResult {
        Ok(())
    }

    fn build_flock(args: &[&str]) -> Flock {
        let mut configuration = FlockConfiguration::parse_args_default(args).unwrap();
        configuration.configure(&FlockDefaults::default());
        Flock::initialize_with_config(configuration).unwrap()
    }

    fn weighted(name: &str, weight: usize) -> UserBehavior {
        UserBehavior::new(name)
            .register_task(task!(noop))
            .set_weight(weight)
            .unwrap()
    }

    #[test]
    fn allocate_behaviors_round_robin() {
        let flock = build_flock(&[])
            .register_behavior(weighted("A", 5))
            .register_behavior(weighted("B", 3));
        assert_eq!(flock.allocate_behaviors(), vec![0, 1, 0, 1, 0, 1, 0, 0]);

        // Weights are reduced by their greatest common divisor.
        let flock = build_flock(&[])
            .register_behavior(weighted("A", 10))
            .register_behavior(weighted("B", 20));
        assert_eq!(flock.allocate_behaviors(), vec![0, 1, 1]);
    }

    #[test]
    fn weighted_users() {
        let flock = build_flock(&["--users", "5", "--host", "http://127.0.0.1"])
            .register_behavior(weighted("A", 1))
            .register_behavior(weighted("B", 1));
        let users = flock.weight_behavior_users().unwrap();
        let indexes: Vec<usize> = users.iter().map(|u| u.behaviors_index).collect();
        assert_eq!(indexes, vec![0, 1, 0, 1, 0]);
        assert_eq!(users[0].base_url.as_str(), "http://127.0.0.1/");
    }

    #[test]
    fn prepare_validates_host() {
        // No host anywhere.
        let mut flock = build_flock(&["--users", "1"]).register_behavior(weighted("A", 1));
        match flock.prepare_load_test() {
            Err(FlockError::InvalidOption { option, detail, .. }) => {
                assert_eq!(option, "--host");
                assert!(detail.contains("no host defined for A"));
            }
            _ => panic!("expected a missing host error"),
        }

        // An invalid host.
        let mut flock = build_flock(&["--users", "1", "--host", "not a host"])
            .register_behavior(weighted("A", 1));
        assert!(matches!(
            flock.prepare_load_test(),
            Err(FlockError::InvalidHost { .. })
        ));

        // A default host.
        let mut flock = *build_flock(&["--users", "2"])
            .register_behavior(weighted("A", 1))
            .set_default(FlockDefault::Host, "http://127.0.0.1")
            .unwrap();
        assert!(flock.prepare_load_test().is_ok());
        assert_eq!(flock.weighted_users.len(), 2);
    }

    #[test]
    fn prepare_validates_weights() {
        let mut flock = build_flock(&["--users", "1", "--host", "http://127.0.0.1"])
            .register_behavior(UserBehavior::new("Idle").register_task(task!(noop).set_weight(0)));
        assert!(matches!(
            flock.prepare_load_test(),
            Err(FlockError::InvalidWeight { .. })
        ));
    }

    #[test]
    fn no_behaviors() {
        match build_flock(&[]).execute() {
            Err(e @ FlockError::NoBehaviors { .. }) => {
                assert_eq!(
                    e.to_string(),
                    "FlockError: no behaviors registered (No behaviors are registered.)"
                );
                assert!(e.source().is_none());
            }
            _ => panic!("expected a NoBehaviors error"),
        }
    }

    #[test]
    fn error_source() {
        let io_error: FlockError = io::Error::other("disk on fire").into();
        assert_eq!(io_error.to_string(), "FlockError: io::Error (disk on fire)");
        assert!(io_error.source().is_some());
    }
}
