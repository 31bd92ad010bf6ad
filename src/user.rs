use std::time;

use crate::behavior::{self, FlockUser, Task, TaskError, TaskFailure, UserBehavior, UserCommand};
use crate::metrics::{ErrorMetric, FlockMetric, TaskMetric, UserErrorMetric};

pub(crate) async fn user_main(
    thread_number: usize,
    thread_behavior: UserBehavior,
    mut thread_user: FlockUser,
    thread_receiver: flume::Receiver<UserCommand>,
) {
    info!(
        "launching user {} from {}...",
        thread_number, thread_behavior.name
    );

    // User is starting, first invoke the on_start task.
    if let Some(on_start) = thread_behavior.on_start.as_ref() {
        debug!(
            "[user {}]: launching on_start {} task from {}",
            thread_number, on_start.name, thread_behavior.name
        );
        let result = tokio::select! {
            biased;
            _ = thread_receiver.recv_async() => {
                exiting(thread_number, &thread_behavior);
                return;
            }
            result = behavior::run_guarded(&on_start.function, &mut thread_user) => result,
        };
        if let Err(failure) = result {
            error!(
                "user {} from {} failed to start: {}",
                thread_number, thread_behavior.name, failure
            );
            if let Some(parent) = thread_user.channel_to_parent.as_ref() {
                // Best effort metrics.
                let _ = parent.send(FlockMetric::UserError(UserErrorMetric {
                    elapsed: thread_user.started.elapsed().as_millis() as u64,
                    behaviors_index: thread_behavior.behaviors_index,
                    behavior_name: thread_behavior.name.clone(),
                    user: thread_user.weighted_users_index,
                    error: failure.to_string(),
                }));
            }
            exiting(thread_number, &thread_behavior);
            return;
        }
    }

    // Weights were validated before the load test started.
    let sampler = match thread_behavior.sampler() {
        Ok(sampler) => sampler,
        Err(e) => {
            error!("user {}: {}", thread_number, e);
            exiting(thread_number, &thread_behavior);
            return;
        }
    };

    // Loop launching tasks until parent tells us to stop.
    loop {
        if received_exit(&thread_receiver) {
            break;
        }

        // Determine which task we're going to run next.
        let task = {
            let mut rng = rand::rng();
            &thread_behavior.tasks[sampler.sample(&mut rng)]
        };
        debug!(
            "[user {}]: launching {} task from {}",
            thread_number, task.name, thread_behavior.name
        );
        if !invoke_task_function(task, &mut thread_user, &thread_receiver).await {
            break;
        }

        // Wait a random time between tasks.
        let wait_time = {
            let mut rng = rand::rng();
            thread_behavior.wait.sample(&mut rng)
        };
        debug!(
            "user {} from {} sleeping {:?} ...",
            thread_number, thread_behavior.name, wait_time
        );
        tokio::select! {
            biased;
            _ = thread_receiver.recv_async() => break,
            _ = tokio::time::sleep(wait_time) => (),
        }
    }

    exiting(thread_number, &thread_behavior);
}

fn exiting(thread_number: usize, thread_behavior: &UserBehavior) {
    info!(
        "exiting user {} from {}...",
        thread_number, thread_behavior.name
    );
}

// Determine if the parent has sent a UserCommand::Exit message, or went away.
fn received_exit(thread_receiver: &flume::Receiver<UserCommand>) -> bool {
    match thread_receiver.try_recv() {
        Ok(UserCommand::Exit) => true,
        Err(flume::TryRecvError::Disconnected) => true,
        Err(flume::TryRecvError::Empty) => false,
    }
}

// Invoke the task function, collecting task metrics. Returns false if the parent told
// the user to exit while the task was running.
async fn invoke_task_function(
    task: &Task,
    thread_user: &mut FlockUser,
    thread_receiver: &flume::Receiver<UserCommand>,
) -> bool {
    let started = time::Instant::now();
    let mut raw_task = TaskMetric::new(
        thread_user.started.elapsed().as_millis(),
        thread_user.behaviors_index,
        task.tasks_index,
        task.name.to_string(),
        thread_user.weighted_users_index,
    );

    let result = tokio::select! {
        biased;
        _ = thread_receiver.recv_async() => return false,
        result = behavior::run_guarded(&task.function, thread_user) => result,
    };
    raw_task.set_time(started.elapsed().as_millis(), result.is_ok());

    let parent = match thread_user.channel_to_parent.as_ref() {
        Some(parent) => parent,
        None => return true,
    };

    // Failed requests were already recorded with the request metric.
    if let Err(failure) = result {
        let record_error = match &failure {
            TaskFailure::Error(e) => !matches!(**e, TaskError::RequestFailed { .. }),
            TaskFailure::Panic(_) => true,
        };
        warn!(
            "user {} task {} failed: {}",
            thread_user.weighted_users_index, task.name, failure
        );
        if record_error {
            let mut error = ErrorMetric::new(None, task.name.to_string(), failure.to_string());
            error.occurrences = 1;
            // Best effort metrics.
            let _ = parent.send(FlockMetric::Error(error));
        }
    }

    // Exit if all metrics or task metrics are disabled.
    if thread_user.config.no_metrics || thread_user.config.no_task_metrics {
        return true;
    }

    // Best effort metrics.
    let _ = parent.send(FlockMetric::Task(raw_task));

    true
}
