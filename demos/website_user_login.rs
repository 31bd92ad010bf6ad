//! The same website user as the `website_user` demo, logging in once when each user
//! starts. The session cookie set by the login is kept for all later requests.
//!
//! ```bash
//! cargo run --example website_user_login -- --host http://127.0.0.1:8080 -u 10 -t 1m
//! ```

use flock::prelude::*;
use std::time::Duration;

fn main() -> Result<(), FlockError> {
    Flock::initialize()?
        .register_behavior(
            behavior!("WebsiteUser")
                // Runs one time when each user starts, before any other task.
                .set_on_start(task!(login))
                .register_task(task!(api).set_weight(5))
                .set_wait_time(Duration::from_millis(5), Duration::from_millis(500))?,
        )
        .execute()?;

    Ok(())
}

/// Logs in with a form POST. If this fails, the user stops and the failure is listed
/// with the user errors at the end of the load test.
async fn login(user: &mut FlockUser) -> TaskResult {
    let params = [("username", "me"), ("password", "s3crET!")];
    let _flock = user.post_form("/login", &params).await?;

    Ok(())
}

/// Loads the api endpoint.
async fn api(user: &mut FlockUser) -> TaskResult {
    let _flock = user.get("/api").await?;

    Ok(())
}
