pub mod job_reaper;
pub mod retention;

pub use job_reaper::job_reaper_loop;
pub use retention::job_retention_loop;
