pub use crate::behavior::{
    FlockMethod, FlockResponse, FlockUser, Task, TaskError, TaskFunction, TaskResult,
    UserBehavior, WaitRange,
};
pub use crate::config::{FlockConfiguration, FlockDefault, FlockDefaultType};
pub use crate::logger::LogFormat;
pub use crate::metrics::{FlockMetrics, RequestMetrics, TaskMetrics};
pub use crate::{behavior, task, Flock, FlockError};
