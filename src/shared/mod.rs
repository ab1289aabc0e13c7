pub mod errors;
pub mod fs_atomic;
pub mod ids;
pub mod logging;
pub mod time;

pub use errors::RuntimeError;
pub use ids::{TaskId, TenantId};
pub use logging::{EventLog, LogLevel};
