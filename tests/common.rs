// Helpers shared by the integration tests. Each test binary uses only some of them.
#![allow(dead_code)]

use gumdrop::Options;
use httpmock::MockServer;
use std::path::Path;

use flock::behavior::UserBehavior;
use flock::config::FlockConfiguration;
use flock::metrics::FlockMetrics;
use flock::Flock;

// Options every test load test needs, with the values used unless a test overrides them.
const BASELINE: [(&str, &str); 3] = [("--users", "1"), ("--hatch-rate", "1"), ("--run-time", "1")];

/// Parse `custom` options into a configuration aimed at the mock server. A short one
/// user, one second run is filled in for any of `--users`, `--hatch-rate` and
/// `--run-time` left out.
pub fn build_configuration(server: &MockServer, custom: Vec<&str>) -> FlockConfiguration {
    let server_url = server.base_url();
    let mut args: Vec<&str> = custom.into_iter().collect();
    if !args.contains(&"--host") {
        args.extend(["--host", server_url.as_str()]);
    }
    for (option, value) in BASELINE {
        if !args.contains(&option) {
            args.extend([option, value]);
        }
    }

    FlockConfiguration::parse_args_default(&args).expect("invalid test options")
}

/// A load test running `behavior` with `configuration`.
pub fn build_load_test(configuration: FlockConfiguration, behavior: &UserBehavior) -> Flock {
    Flock::initialize_with_config(configuration)
        .unwrap()
        .register_behavior(behavior.clone())
}

/// Run a load test to completion.
pub fn run_load_test(flock: Flock) -> FlockMetrics {
    flock.execute().unwrap()
}

/// Lines in a file written by a load test, 0 if it wasn't written.
pub fn file_length(file_name: &str) -> usize {
    std::fs::read_to_string(file_name).map_or(0, |contents| contents.lines().count())
}

/// Remove files left by an earlier run.
pub fn cleanup_files(files: Vec<&str>) {
    for file in files.into_iter().filter(|file| Path::new(file).exists()) {
        std::fs::remove_file(file).expect("failed to remove test file");
    }
}
