//! Calendar bucketing and the clock abstraction

pub mod bucketer;
pub mod clock;

pub use bucketer::{
    bucket_scores, day_start_utc, local_date, split_range, Granularity, TimeBucket,
};
pub use clock::{Clock, ManualClock, SystemClock};
