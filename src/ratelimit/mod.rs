//! Request quota limiting per key and time window.

mod backend;
mod distributed;
mod local;
mod throttle;
mod window;

pub use backend::{PeriodLimiter, PermitState};
pub use distributed::DistributedPeriodLimiter;
pub use local::LocalPeriodLimiter;
pub use throttle::Throttle;
pub use window::Window;
