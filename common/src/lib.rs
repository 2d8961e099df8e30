pub mod clock;
pub mod config;
pub mod error;
pub mod led;
pub mod registry;
pub mod scheduler;
pub mod sunrise;
pub mod task;
pub mod timespec;
pub mod topics;
pub mod types;

pub use clock::{ManualClock, MonotonicClock, SystemClock};
pub use config::{ConfigOverrides, DeviceConfig, TimerConfig};
pub use error::{ConfigError, TimerError};
pub use led::{Channel, LedDriver, LedLevels};
pub use registry::{Registry, DEFAULT_MAX_TASKS};
pub use scheduler::TimerSystem;
pub use sunrise::SunriseRamp;
pub use task::{ClosureTask, FnTask, Task, TaskContext, TaskId, TaskRef};
pub use timespec::TimeSpec;
pub use topics::*;
pub use types::HeartbeatPayload;
