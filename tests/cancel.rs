/// Validate that Flock shuts down promptly, both when it receives SIGINT (control-c)
/// and when the run time expires while users are busy.
use httpmock::{Method::GET, Mock, MockServer};
use nix::sys::signal::{kill, SIGINT};
use nix::unistd::getpid;
use serial_test::serial;
use std::time::{Duration, Instant};

mod common;

use flock::prelude::*;

// Paths used in load tests performed during these tests.
const API_PATH: &str = "/api";

// Indexes to the above paths.
const API_KEY: usize = 0;

const USERS: usize = 4;

pub async fn api(user: &mut FlockUser) -> TaskResult {
    let _flock = user.get(API_PATH).await?;
    Ok(())
}

// A task that outlives any load test in this file.
pub async fn stalled(_user: &mut FlockUser) -> TaskResult {
    tokio::time::sleep(Duration::from_secs(60)).await;
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
        .set_wait_time(Duration::from_millis(5), Duration::from_millis(500))
        .unwrap()
}

// Send SIGINT to this process after a delay, from its own thread.
fn cancel_load_test(delay: Duration) {
    std::thread::spawn(move || {
        std::thread::sleep(delay);
        kill(getpid(), SIGINT).expect("failed to send SIGINT");
    });
}

#[test]
#[serial]
// Cancel a load test that has no run time, it stops and still returns metrics.
fn test_cancel_noruntime() {
    let server = MockServer::start();
    let mock_endpoints = setup_mock_server_endpoints(&server);

    let configuration = common::build_configuration(
        &server,
        vec![
            "--users",
            "4",
            "--hatch-rate",
            "4",
            "--run-time",
            "0",
            "--no-reset-metrics",
        ],
    );
    let flock = common::build_load_test(configuration, &website_user());

    cancel_load_test(Duration::from_secs(3));
    let started = Instant::now();
    let flock_metrics = common::run_load_test(flock);
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_secs(2));
    assert!(elapsed < Duration::from_secs(8), "slow shutdown: {:?}", elapsed);

    // All users launched before the load test was canceled.
    assert_eq!(flock_metrics.users, USERS);
    let api_hits = mock_endpoints[API_KEY].hits();
    assert!(api_hits > USERS);
    let api_metrics = flock_metrics
        .requests
        .get(&format!("GET {}", API_PATH))
        .unwrap();
    assert!(api_metrics.success_count <= api_hits);
    assert!(api_hits - api_metrics.success_count <= USERS);
}

#[test]
#[serial]
// Cancel a load test while users are still launching.
fn test_cancel_while_launching() {
    let server = MockServer::start();
    let mock_endpoints = setup_mock_server_endpoints(&server);

    // Launching 20 users at 2 per second would take 10 seconds.
    let configuration = common::build_configuration(
        &server,
        vec![
            "--users",
            "20",
            "--hatch-rate",
            "2",
            "--run-time",
            "30",
            "--no-reset-metrics",
        ],
    );
    let flock = common::build_load_test(configuration, &website_user());

    cancel_load_test(Duration::from_secs(2));
    let started = Instant::now();
    let flock_metrics = common::run_load_test(flock);

    assert!(started.elapsed() < Duration::from_secs(8));
    assert!(flock_metrics.users < 20);
    assert!(mock_endpoints[API_KEY].hits() > 0);
}

#[test]
#[serial]
// A user stuck in a task doesn't keep the load test from stopping when its run time
// expires, and the interrupted task isn't recorded.
fn test_run_time_interrupts_task() {
    let server = MockServer::start();
    let mock_endpoints = setup_mock_server_endpoints(&server);

    let behavior = behavior!("StalledUser")
        .register_task(task!(stalled))
        .set_wait_time(Duration::from_millis(5), Duration::from_millis(500))
        .unwrap();
    let configuration = common::build_configuration(
        &server,
        vec!["--users", "2", "--hatch-rate", "4", "--no-reset-metrics"],
    );

    let started = Instant::now();
    let flock_metrics = common::run_load_test(common::build_load_test(configuration, &behavior));

    assert!(started.elapsed() < Duration::from_secs(5));
    mock_endpoints[API_KEY].assert_hits(0);
    assert_eq!(flock_metrics.tasks[0][0].counter, 0);
}

#[test]
#[serial]
// A user waiting between tasks stops as soon as the run time expires.
fn test_run_time_interrupts_wait() {
    let server = MockServer::start();
    let mock_endpoints = setup_mock_server_endpoints(&server);

    let behavior = behavior!("PatientUser")
        .register_task(task!(api))
        .set_wait_time(Duration::from_secs(60), Duration::from_secs(60))
        .unwrap();
    let configuration = common::build_configuration(
        &server,
        vec!["--users", "2", "--hatch-rate", "4", "--no-reset-metrics"],
    );

    let started = Instant::now();
    let flock_metrics = common::run_load_test(common::build_load_test(configuration, &behavior));

    assert!(started.elapsed() < Duration::from_secs(5));
    // Each user ran its task once, then waited.
    mock_endpoints[API_KEY].assert_hits(2);
    assert_eq!(flock_metrics.tasks[0][0].success_count, 2);
}
