use gumdrop::Options;
use httpmock::{Method::GET, Mock, MockServer};
use std::time::Duration;

mod common;

use flock::prelude::*;

// Paths used in load tests performed during these tests.
const API_PATH: &str = "/api";

const USERS: usize = 3;
const RUN_TIME: usize = 2;
const HATCH_RATE: &str = "10";

pub async fn api(user: &mut FlockUser) -> TaskResult {
    let _flock = user.get(API_PATH).await?;
    Ok(())
}

fn setup_mock_server_endpoints(server: &MockServer) -> Mock {
    server.mock(|when, then| {
        when.method(GET).path(API_PATH);
        then.status(200);
    })
}

fn website_user() -> UserBehavior {
    behavior!("WebsiteUser")
        .register_task(task!(api).set_weight(5))
        .set_wait_time(Duration::from_millis(5), Duration::from_millis(500))
        .unwrap()
}

#[test]
// Configure the load test entirely with programmatic defaults.
fn test_defaults() {
    const REQUEST_LOG: &str = "defaults-request.log";
    common::cleanup_files(vec![REQUEST_LOG]);

    let server = MockServer::start();
    let api = setup_mock_server_endpoints(&server);
    let host = server.base_url();

    let configuration = FlockConfiguration::parse_args_default(&[] as &[&str]).unwrap();
    let flock_metrics = *Flock::initialize_with_config(configuration)
        .unwrap()
        .register_behavior(website_user())
        .set_default(FlockDefault::Host, host.as_str())
        .unwrap()
        .set_default(FlockDefault::Users, USERS)
        .unwrap()
        .set_default(FlockDefault::HatchRate, HATCH_RATE)
        .unwrap()
        .set_default(FlockDefault::RunTime, RUN_TIME)
        .unwrap()
        .set_default(FlockDefault::NoResetMetrics, true)
        .unwrap()
        .set_default(FlockDefault::NoPrintMetrics, true)
        .unwrap()
        .set_default(FlockDefault::RequestLog, REQUEST_LOG)
        .unwrap()
        .set_default(FlockDefault::RequestFormat, LogFormat::Csv)
        .unwrap();
    let flock_metrics = flock_metrics.execute().unwrap();

    assert_eq!(flock_metrics.users, USERS);
    assert!(flock_metrics.duration >= RUN_TIME);
    let hits = api.hits();
    assert!(hits >= USERS);

    // The csv request log has a header, then one line per recorded request.
    let api_metrics = flock_metrics
        .requests
        .get(&format!("GET {}", API_PATH))
        .unwrap();
    assert_eq!(
        common::file_length(REQUEST_LOG),
        api_metrics.success_count + 1
    );

    common::cleanup_files(vec![REQUEST_LOG]);
}

#[test]
// Command line options win over programmatic defaults.
fn test_options_override_defaults() {
    let server = MockServer::start();
    let api = setup_mock_server_endpoints(&server);

    let configuration = common::build_configuration(
        &server,
        vec!["--users", "2", "--hatch-rate", "4", "--no-reset-metrics"],
    );
    let flock_metrics = Flock::initialize_with_config(configuration)
        .unwrap()
        .register_behavior(website_user())
        // The configured --host wins, so this invalid default host is never used.
        .set_default(FlockDefault::Host, "http://127.0.0.1:1")
        .unwrap()
        .set_default(FlockDefault::Users, 5usize)
        .unwrap()
        .execute()
        .unwrap();

    assert_eq!(flock_metrics.users, 2);
    assert!(api.hits() > 0);
}

#[test]
// A host can be set on the behavior itself.
fn test_behavior_host() {
    let server = MockServer::start();
    let api = setup_mock_server_endpoints(&server);

    let mut configuration = common::build_configuration(&server, vec![]);
    // Leaves an empty string in configuration.host.
    let host = std::mem::take(&mut configuration.host);
    let flock_metrics = Flock::initialize_with_config(configuration)
        .unwrap()
        .register_behavior(website_user().set_host(&host))
        .execute()
        .unwrap();

    assert_eq!(flock_metrics.users, 1);
    assert!(api.hits() > 0);
}

#[test]
// A load test can't start without a host, nor without behaviors.
fn test_missing_host_and_behaviors() {
    let configuration = FlockConfiguration::parse_args_default(&["--users", "1"]).unwrap();
    match Flock::initialize_with_config(configuration)
        .unwrap()
        .register_behavior(website_user())
        .execute()
    {
        Err(FlockError::InvalidOption { option, .. }) => assert_eq!(option, "--host"),
        _ => panic!("expected a missing host error"),
    }

    let configuration = FlockConfiguration::parse_args_default(&["--host", "http://127.0.0.1"])
        .unwrap();
    assert!(matches!(
        Flock::initialize_with_config(configuration).unwrap().execute(),
        Err(FlockError::NoBehaviors { .. })
    ));
}

#[test]
// Conflicting options are rejected before the load test starts.
fn test_invalid_options() {
    let server = MockServer::start();
    let api = setup_mock_server_endpoints(&server);

    for options in [
        vec!["--verbose", "--quiet"],
        vec!["--users", "0"],
        vec!["--hatch-rate", "0"],
        vec!["--timeout", "0"],
        vec!["--request-format", "csv"],
        vec!["--no-metrics", "--no-task-metrics"],
        vec!["--no-metrics", "--running-metrics", "1"],
    ] {
        let configuration = common::build_configuration(&server, options.clone());
        assert!(
            matches!(
                common::build_load_test(configuration, &website_user()).execute(),
                Err(FlockError::InvalidOption { .. })
            ),
            "{:?} should be rejected",
            options
        );
    }

    api.assert_hits(0);
}

#[test]
// Metrics can be disabled entirely.
fn test_no_metrics() {
    let server = MockServer::start();
    let api = setup_mock_server_endpoints(&server);

    let configuration = common::build_configuration(&server, vec!["--no-metrics"]);
    let flock_metrics =
        common::run_load_test(common::build_load_test(configuration, &website_user()));

    assert!(api.hits() > 0);
    assert!(flock_metrics.requests.is_empty());
    assert!(flock_metrics.tasks.is_empty());
}
