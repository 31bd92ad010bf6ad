//! Functions and structures related to configuring a Flock load test.
//!
//! Flock can be configured at run time by passing in the options and flags defined by
//! the [`FlockConfiguration`] structure.
//!
//! Flock can be configured programmatically with [`FlockDefaultType::set_default`].

use gumdrop::Options;
use serde::{Deserialize, Serialize};
use simplelog::*;
use std::path::PathBuf;

use crate::logger::LogFormat;
use crate::util;
use crate::{Flock, FlockError};

/// Runtime options available when launching a Flock load test.
///
/// Custom defaults can be programmatically set for most of these options using
/// [`FlockDefaultType::set_default`].
///
/// Help is generated for all of these options by passing a `-h` flag to an
/// application built with the Flock library, derived from this structure with
/// [`gumdrop`](https://docs.rs/gumdrop/).
#[derive(Options, Debug, Clone, Default, Serialize, Deserialize)]
#[options(
    help = r#"Flock drives simulated users that each run a weighted set of tasks
against an HTTP(S) server, sleeping a random time between tasks.

The following runtime options are available when launching a Flock load test:"#
)]
pub struct FlockConfiguration {
    /// Displays this help
    #[options(short = "h")]
    pub help: bool,
    /// Prints version information
    #[options(short = "V")]
    pub version: bool,
    /// Lists all behaviors and tasks and exits
    // Add a blank line after this option
    #[options(short = "l", help = "Lists all behaviors and tasks and exits\n")]
    pub list: bool,

    /// Defines host to load test (ie http://10.21.32.33)
    #[options(short = "H")]
    pub host: String,
    /// Sets concurrent users (default: number of CPUs)
    #[options(short = "u")]
    pub users: Option<usize>,
    /// Sets per-second user hatch rate (default: 1)
    #[options(short = "r", meta = "RATE")]
    pub hatch_rate: Option<String>,
    /// Stops load test after (30s, 20m, 3h, 1h30m, etc)
    #[options(short = "t", meta = "TIME")]
    pub run_time: String,
    /// Enables log file and sets name
    #[options(short = "G", meta = "NAME")]
    pub log_file: String,
    /// Increases log file level (-g, -gg, etc)
    #[options(short = "g", count)]
    pub log_level: u8,
    /// Decreases verbosity (-q, -qq, etc)
    #[options(count, short = "q", help = "Decreases verbosity (-q, -qq, etc)")]
    pub quiet: u8,
    /// Increases verbosity (-v, -vv, etc)
    #[options(
        count,
        short = "v",
        // Add a blank line and then a 'Metrics:' header after this option
        help = "Increases verbosity (-v, -vv, etc)\n\nMetrics:"
    )]
    pub verbose: u8,

    /// How often to optionally print running metrics
    #[options(no_short, meta = "TIME")]
    pub running_metrics: Option<usize>,
    /// Doesn't reset metrics after all users have started
    #[options(no_short)]
    pub no_reset_metrics: bool,
    /// Doesn't track metrics
    #[options(no_short)]
    pub no_metrics: bool,
    /// Doesn't track task metrics
    #[options(no_short)]
    pub no_task_metrics: bool,
    /// Doesn't display metrics at end of load test
    #[options(no_short)]
    pub no_print_metrics: bool,
    /// Doesn't display an error summary
    #[options(no_short)]
    pub no_error_summary: bool,
    /// Sets request log file name
    #[options(short = "R", meta = "NAME")]
    pub request_log: String,
    /// Sets request log format (csv, json, raw, pretty)
    // Add a blank line and then an Advanced: header after this option
    #[options(
        no_short,
        meta = "FORMAT",
        help = "Sets request log format (csv, json, raw, pretty)\n\nAdvanced:"
    )]
    pub request_format: Option<LogFormat>,

    /// Sets per-request timeout, in seconds (default: 60)
    #[options(no_short, meta = "VALUE")]
    pub timeout: Option<String>,
    /// Doesn't set the gzip Accept-Encoding header
    #[options(no_short)]
    pub no_gzip: bool,
}

/// Defaults set with [`FlockDefaultType::set_default()`], one per
/// [`FlockConfiguration`] option of the same name. Options given at run time win.
#[derive(Clone, Debug, Default)]
pub(crate) struct FlockDefaults {
    pub host: Option<String>,
    pub users: Option<usize>,
    pub hatch_rate: Option<String>,
    pub run_time: Option<usize>,
    pub log_level: Option<u8>,
    pub log_file: Option<String>,
    pub quiet: Option<u8>,
    pub verbose: Option<u8>,
    pub running_metrics: Option<usize>,
    pub no_reset_metrics: Option<bool>,
    pub no_metrics: Option<bool>,
    pub no_task_metrics: Option<bool>,
    pub no_print_metrics: Option<bool>,
    pub no_error_summary: Option<bool>,
    pub request_log: Option<String>,
    pub request_format: Option<LogFormat>,
    pub timeout: Option<String>,
    pub no_gzip: Option<bool>,
}

/// The options a load test can give a default with [`FlockDefaultType::set_default()`].
///
/// Each variant names the [`FlockConfiguration`] field it fills in when that option
/// isn't given at run time.
#[derive(Debug)]
pub enum FlockDefault {
    /// `--host`, used by behaviors without a host of their own.
    Host,
    Users,
    HatchRate,
    /// `--run-time`, in seconds.
    RunTime,
    LogLevel,
    LogFile,
    Quiet,
    Verbose,
    RunningMetrics,
    NoResetMetrics,
    NoMetrics,
    NoTaskMetrics,
    NoPrintMetrics,
    NoErrorSummary,
    RequestLog,
    RequestFormat,
    /// `--timeout`, in seconds.
    Timeout,
    NoGzip,
}
impl FlockDefault {
    // The type `set_default` expects for this option.
    fn expected_type(&self) -> &'static str {
        match self {
            FlockDefault::Host
            | FlockDefault::HatchRate
            | FlockDefault::LogFile
            | FlockDefault::RequestLog
            | FlockDefault::Timeout => "&str",
            FlockDefault::Users
            | FlockDefault::RunTime
            | FlockDefault::LogLevel
            | FlockDefault::Quiet
            | FlockDefault::Verbose
            | FlockDefault::RunningMetrics => "usize",
            FlockDefault::NoResetMetrics
            | FlockDefault::NoMetrics
            | FlockDefault::NoTaskMetrics
            | FlockDefault::NoPrintMetrics
            | FlockDefault::NoErrorSummary
            | FlockDefault::NoGzip => "bool",
            FlockDefault::RequestFormat => "LogFormat",
        }
    }

    // A helpful and explicit error for a value of the wrong type.
    fn invalid_type(self, value: String, received: &str) -> FlockError {
        FlockError::InvalidOption {
            option: format!("FlockDefault::{:?}", self),
            detail: format!(
                "set_default(FlockDefault::{:?}, {}) expected {} value, received {}",
                self,
                value,
                self.expected_type(),
                received
            ),
            value,
        }
    }
}

/// Set a default for a run-time option, typed by the option.
///
/// Hosts, file names, the hatch rate and the timeout take a [`&str`]. Counts and
/// seconds take a [`usize`]. Flags take a [`bool`], and the request format takes a
/// [`LogFormat`]. Any other pairing is a [`FlockError::InvalidOption`].
///
/// # Example
/// ```rust
/// use flock::prelude::*;
///
/// fn main() -> Result<(), FlockError> {
///     Flock::initialize_with_config(FlockConfiguration::default())?
///         .set_default(FlockDefault::Host, "http://local.dev")?;
///
///     let wrong_type = Flock::initialize_with_config(FlockConfiguration::default())?
///         .set_default(FlockDefault::Host, 8);
///     assert!(wrong_type.is_err());
///
///     Ok(())
/// }
/// ```
pub trait FlockDefaultType<T> {
    /// Sets a [`FlockDefault`], returning the load test for chaining.
    ///
    /// # Example
    /// ```rust
    /// use flock::prelude::*;
    ///
    /// fn main() -> Result<(), FlockError> {
    ///     Flock::initialize_with_config(FlockConfiguration::default())?
    ///         // Do not reset the metrics after all users have started.
    ///         .set_default(FlockDefault::NoResetMetrics, true)?
    ///         // Do not display info level logs while the test runs.
    ///         .set_default(FlockDefault::Quiet, 1)?
    ///         // Log all requests made during the test to `./flock-request.log`.
    ///         .set_default(FlockDefault::RequestLog, "flock-request.log")?;
    ///
    ///     Ok(())
    /// }
    /// ```
    fn set_default(self, key: FlockDefault, value: T) -> Result<Box<Self>, FlockError>;
}
impl FlockDefaultType<&str> for Flock {
    fn set_default(mut self, key: FlockDefault, value: &str) -> Result<Box<Self>, FlockError> {
        match key {
            FlockDefault::HatchRate => self.defaults.hatch_rate = Some(value.to_string()),
            FlockDefault::Host => {
                self.defaults.host = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                }
            }
            FlockDefault::LogFile => self.defaults.log_file = Some(value.to_string()),
            FlockDefault::RequestLog => self.defaults.request_log = Some(value.to_string()),
            FlockDefault::Timeout => self.defaults.timeout = Some(value.to_string()),
            _ => return Err(key.invalid_type(value.to_string(), "&str")),
        }
        Ok(Box::new(self))
    }
}
impl FlockDefaultType<usize> for Flock {
    fn set_default(mut self, key: FlockDefault, value: usize) -> Result<Box<Self>, FlockError> {
        match key {
            FlockDefault::Users => self.defaults.users = Some(value),
            FlockDefault::RunTime => self.defaults.run_time = Some(value),
            FlockDefault::RunningMetrics => self.defaults.running_metrics = Some(value),
            FlockDefault::LogLevel => self.defaults.log_level = Some(value as u8),
            FlockDefault::Quiet => self.defaults.quiet = Some(value as u8),
            FlockDefault::Verbose => self.defaults.verbose = Some(value as u8),
            _ => return Err(key.invalid_type(value.to_string(), "usize")),
        }
        Ok(Box::new(self))
    }
}
impl FlockDefaultType<bool> for Flock {
    fn set_default(mut self, key: FlockDefault, value: bool) -> Result<Box<Self>, FlockError> {
        match key {
            FlockDefault::NoResetMetrics => self.defaults.no_reset_metrics = Some(value),
            FlockDefault::NoMetrics => self.defaults.no_metrics = Some(value),
            FlockDefault::NoTaskMetrics => self.defaults.no_task_metrics = Some(value),
            FlockDefault::NoPrintMetrics => self.defaults.no_print_metrics = Some(value),
            FlockDefault::NoErrorSummary => self.defaults.no_error_summary = Some(value),
            FlockDefault::NoGzip => self.defaults.no_gzip = Some(value),
            _ => return Err(key.invalid_type(value.to_string(), "bool")),
        }
        Ok(Box::new(self))
    }
}
impl FlockDefaultType<LogFormat> for Flock {
    fn set_default(
        mut self,
        key: FlockDefault,
        value: LogFormat,
    ) -> Result<Box<Self>, FlockError> {
        match key {
            FlockDefault::RequestFormat => self.defaults.request_format = Some(value),
            _ => return Err(key.invalid_type(format!("{:?}", value), "LogFormat")),
        }
        Ok(Box::new(self))
    }
}

// An empty string option falls back to its FlockDefault, if set.
fn or_default_string(option: &mut String, default: &Option<String>) {
    if option.is_empty() {
        if let Some(default) = default {
            option.clone_from(default);
        }
    }
}

impl FlockConfiguration {
    /// Apply precedence to every option: a run-time option wins over a
    /// [`FlockDefault`], which wins over the built-in default.
    pub(crate) fn configure(&mut self, defaults: &FlockDefaults) {
        // Counted flags are only replaced when not given on the command line.
        if self.quiet == 0 {
            self.quiet = defaults.quiet.unwrap_or(0);
        }
        if self.verbose == 0 {
            self.verbose = defaults.verbose.unwrap_or(0);
        }
        if self.log_level == 0 {
            self.log_level = defaults.log_level.unwrap_or(0);
        }
        or_default_string(&mut self.log_file, &defaults.log_file);

        // Initialize the logger before logging any configured values.
        self.initialize_logger();

        self.users = self.users.or(defaults.users).or_else(|| {
            let cpus = std::thread::available_parallelism()
                .map(|cpus| cpus.get())
                .unwrap_or_else(|e| {
                    info!("failed to detect available_parallelism: {}", e);
                    1
                });
            info!("users defaulted to number of CPUs");
            Some(cpus)
        });

        let run_time = match util::parse_timespan(&self.run_time) {
            0 => defaults.run_time.unwrap_or(0),
            seconds => seconds,
        };
        self.run_time = run_time.to_string();

        // Float options are kept as given, validate() rejects values that don't parse.
        if self.hatch_rate.is_none() {
            self.hatch_rate.clone_from(&defaults.hatch_rate);
        }
        if self.timeout.is_none() {
            self.timeout.clone_from(&defaults.timeout);
        }
        self.running_metrics = self.running_metrics.or(defaults.running_metrics);

        // A flag set on the command line can't be unset by a default.
        self.no_reset_metrics |= defaults.no_reset_metrics.unwrap_or(false);
        self.no_metrics |= defaults.no_metrics.unwrap_or(false);
        self.no_task_metrics |= defaults.no_task_metrics.unwrap_or(false);
        self.no_print_metrics |= defaults.no_print_metrics.unwrap_or(false);
        self.no_error_summary |= defaults.no_error_summary.unwrap_or(false);
        self.no_gzip |= defaults.no_gzip.unwrap_or(false);

        or_default_string(&mut self.request_log, &defaults.request_log);
        self.request_format = self
            .request_format
            .or(defaults.request_format)
            .or_else(|| (!self.request_log.is_empty()).then_some(LogFormat::Json));

        info!(
            "users = {:?}, hatch_rate = {:?}, run_time = {}s",
            self.users, self.hatch_rate, self.run_time
        );
        if !self.request_log.is_empty() {
            info!(
                "request_log = {} ({:?})",
                self.request_log, self.request_format
            );
        }
        debug!("configuration: {:?}", self);
    }

    /// Validate that all options are sane, and don't conflict with each other.
    pub(crate) fn validate(&self) -> Result<(), FlockError> {
        // Can't set both --verbose and --quiet.
        if self.verbose > 0 && self.quiet > 0 {
            return Err(FlockError::InvalidOption {
                option: "`configuration.verbose`".to_string(),
                value: self.verbose.to_string(),
                detail: "`configuration.verbose` can not be set with `configuration.quiet`."
                    .to_string(),
            });
        }

        // If set, hatch rate must be a number greater than 0.
        if let Some(hatch_rate) = self.hatch_rate.as_deref() {
            match util::parse_float(Some(hatch_rate)) {
                Some(rate) if rate > 0.0 => (),
                _ => {
                    return Err(FlockError::InvalidOption {
                        option: "`configuration.hatch_rate`".to_string(),
                        value: hatch_rate.to_string(),
                        detail: "`configuration.hatch_rate` must be greater than 0.".to_string(),
                    });
                }
            }
        }

        // If set, timeout must be a number greater than 0.
        if let Some(timeout) = self.timeout.as_deref() {
            match util::parse_float(Some(timeout)) {
                Some(seconds) if seconds > 0.0 => (),
                _ => {
                    return Err(FlockError::InvalidOption {
                        option: "`configuration.timeout`".to_string(),
                        value: timeout.to_string(),
                        detail: "`configuration.timeout` must be greater than 0.".to_string(),
                    });
                }
            }
        }

        // Validate `users`.
        if let Some(users) = self.users.as_ref() {
            if users == &0 {
                return Err(FlockError::InvalidOption {
                    option: "configuration.users".to_string(),
                    value: users.to_string(),
                    detail: "`configuration.users` must be set to at least 1.".to_string(),
                });
            }
        }

        // Request format requires a request log.
        if let Some(request_format) = self.request_format.as_ref() {
            if self.request_log.is_empty() {
                return Err(FlockError::InvalidOption {
                    option: "`configuration.request_format`".to_string(),
                    value: format!("{:?}", request_format),
                    detail: "`configuration.request_format` can not be set without setting `configuration.request_log`.".to_string(),
                });
            }
        }

        if self.no_metrics {
            // Task metrics are a subset of metrics.
            if self.no_task_metrics {
                return Err(FlockError::InvalidOption {
                    option: "`configuration.no_task_metrics`".to_string(),
                    value: true.to_string(),
                    detail: "`configuration.no_task_metrics` can not be set together with `configuration.no_metrics`.".to_string(),
                });
            }

            // There are no running metrics to display.
            if let Some(running_metrics) = self.running_metrics {
                return Err(FlockError::InvalidOption {
                    option: "`configuration.running_metrics`".to_string(),
                    value: running_metrics.to_string(),
                    detail: "`configuration.running_metrics` can not be set together with `configuration.no_metrics`.".to_string(),
                });
            }
        }

        Ok(())
    }

    /// Initialize the logger which writes to standard out and optionally to a
    /// configurable log file.
    pub(crate) fn initialize_logger(&self) {
        // Configure debug output level.
        let debug_level = match self.verbose {
            0 => match self.quiet {
                0 => LevelFilter::Info,
                _ => LevelFilter::Warn,
            },
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        // Configure log file level.
        let log_level = match self.log_level {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Info,
            2 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        let mut loggers: Vec<Box<dyn SharedLogger>> =
            vec![SimpleLogger::new(debug_level, Config::default())];

        // Open the log file if configured.
        let log_file: Option<PathBuf> = if !self.log_file.is_empty() {
            Some(PathBuf::from(&self.log_file))
        } else {
            None
        };
        if let Some(log_to_file) = log_file.as_ref() {
            match std::fs::File::create(log_to_file) {
                Ok(file) => loggers.push(WriteLogger::new(log_level, Config::default(), file)),
                Err(e) => eprintln!(
                    "failed to create log file {}: {}",
                    log_to_file.display(),
                    e
                ),
            }
        }

        // A logger may already be installed, for example by an earlier load test in the
        // same process.
        if let Err(e) = CombinedLogger::init(loggers) {
            info!("failed to initialize CombinedLogger: {}", e);
        }

        if let Some(log_to_file) = log_file {
            info!("Writing to log file: {}", log_to_file.display());
        }
        info!("Output verbosity level: {}", debug_level);
        info!("Logfile verbosity level: {}", log_level);
    }
}
