pub mod backoff;
pub mod clock;

pub use backoff::delay_after_attempt;
pub use clock::{Clock, ManualClock, SystemClock};
