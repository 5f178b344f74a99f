pub use crate::http::ApiDoc;
pub use crate::http::build_metrics_router;
pub use crate::http::build_router;
pub use crate::tasks::job_reaper::job_reaper_loop;
pub use crate::tasks::retention::job_retention_loop;
