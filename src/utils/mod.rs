pub mod constants;
pub mod progress;
pub mod time;

pub use constants::*;
pub use progress::ProgressReporter;
pub use time::{format_cf_timestamp, parse_timestamp};
