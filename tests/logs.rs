use httpmock::{Method::GET, Mock, MockServer};
use std::time::Duration;

mod common;

use flock::prelude::*;

// Paths used in load tests performed during these tests.
const API_PATH: &str = "/api";

// Indexes to the above paths.
const API_KEY: usize = 0;

pub async fn api(user: &mut FlockUser) -> TaskResult {
    let _flock = user.get(API_PATH).await?;
    Ok(())
}

fn setup_mock_server_endpoints(server: &MockServer) -> Vec<Mock> {
    vec![server.mock(|when, then| {
        when.method(GET).path(API_PATH);
        then.status(200);
    })]
}

fn website_user() -> UserBehavior {
    behavior!("WebsiteUser")
        .register_task(task!(api).set_weight(5))
        .set_wait_time(Duration::from_millis(5), Duration::from_millis(100))
        .unwrap()
}

// Run a short load test writing a request log, returning the number of requests
// that were recorded.
fn run_logged_load_test(request_log: &str, format: Option<&str>) -> usize {
    let server = MockServer::start();
    let mock_endpoints = setup_mock_server_endpoints(&server);

    let mut options = vec![
        "--users",
        "2",
        "--hatch-rate",
        "4",
        "--no-reset-metrics",
        "--request-log",
        request_log,
    ];
    if let Some(format) = format {
        options.extend_from_slice(&["--request-format", format]);
    }
    let configuration = common::build_configuration(&server, options);
    let flock_metrics =
        common::run_load_test(common::build_load_test(configuration, &website_user()));

    let api_metrics = flock_metrics
        .requests
        .get(&format!("GET {}", API_PATH))
        .unwrap();
    assert!(api_metrics.success_count > 0);
    assert!(mock_endpoints[API_KEY].hits() >= api_metrics.success_count);
    api_metrics.success_count
}

#[test]
// Requests are logged as json by default, one per line.
fn test_request_log_json() {
    const REQUEST_LOG: &str = "request-json.log";
    common::cleanup_files(vec![REQUEST_LOG]);

    let requests = run_logged_load_test(REQUEST_LOG, None);
    assert_eq!(common::file_length(REQUEST_LOG), requests);

    let log = std::fs::read_to_string(REQUEST_LOG).unwrap();
    for line in log.lines() {
        let request: serde_json::Value = serde_json::from_str(line).unwrap();
        assert_eq!(request["name"], API_PATH);
        assert_eq!(request["status_code"], 200);
        assert_eq!(request["success"], true);
    }

    common::cleanup_files(vec![REQUEST_LOG]);
}

#[test]
// The csv request log starts with a header.
fn test_request_log_csv() {
    const REQUEST_LOG: &str = "request-csv.log";
    common::cleanup_files(vec![REQUEST_LOG]);

    let requests = run_logged_load_test(REQUEST_LOG, Some("csv"));
    assert_eq!(common::file_length(REQUEST_LOG), requests + 1);

    let log = std::fs::read_to_string(REQUEST_LOG).unwrap();
    let mut lines = log.lines();
    let columns = lines.next().unwrap().split(',').count();
    for line in lines {
        assert_eq!(line.split(',').count(), columns);
        assert!(line.contains(API_PATH));
    }

    common::cleanup_files(vec![REQUEST_LOG]);
}

#[test]
// The raw request log writes one debug-formatted request per line.
fn test_request_log_raw() {
    const REQUEST_LOG: &str = "request-raw.log";
    common::cleanup_files(vec![REQUEST_LOG]);

    let requests = run_logged_load_test(REQUEST_LOG, Some("raw"));
    assert_eq!(common::file_length(REQUEST_LOG), requests);

    let log = std::fs::read_to_string(REQUEST_LOG).unwrap();
    assert!(log.lines().all(|line| line.starts_with("RequestMetric {")));

    common::cleanup_files(vec![REQUEST_LOG]);
}

#[test]
// The pretty request log spreads each request across multiple lines.
fn test_request_log_pretty() {
    const REQUEST_LOG: &str = "request-pretty.log";
    common::cleanup_files(vec![REQUEST_LOG]);

    let requests = run_logged_load_test(REQUEST_LOG, Some("pretty"));
    assert!(common::file_length(REQUEST_LOG) > requests * 2);

    let log = std::fs::read_to_string(REQUEST_LOG).unwrap();
    assert_eq!(log.matches("RequestMetric {").count(), requests);

    common::cleanup_files(vec![REQUEST_LOG]);
}
