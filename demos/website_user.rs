//! A website user that repeatedly loads `/api`, waiting 5 to 500 milliseconds between
//! requests.
//!
//! ```bash
//! cargo run --example website_user -- --host http://127.0.0.1:8080 -u 10 -r 2 -t 1m
//! ```

use flock::prelude::*;
use std::time::Duration;

fn main() -> Result<(), FlockError> {
    Flock::initialize()?
        .register_behavior(
            behavior!("WebsiteUser")
                .register_task(task!(api).set_weight(5))
                // After each task runs, sleep randomly from 5 to 500 milliseconds.
                .set_wait_time(Duration::from_millis(5), Duration::from_millis(500))?,
        )
        .execute()?;

    Ok(())
}

/// Loads the api endpoint.
async fn api(user: &mut FlockUser) -> TaskResult {
    let _flock = user.get("/api").await?;

    Ok(())
}
