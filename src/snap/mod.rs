pub mod capture;
pub mod config;
pub mod inspect;
pub mod intake;
pub mod metrics;
pub mod paths;
pub mod pipeline;
pub mod prompts;
pub mod providers;
pub mod rate_limiter;
pub mod record_store;
pub mod records;
pub mod retention;
pub mod scheduler;
pub mod snapshots;
pub mod storage;
pub mod tags;
pub mod usage;
pub mod util;
