mod executor;
mod time;

pub use executor::Executor;
pub use time::{Deadline, Duration, Instant};
