pub mod discovery;
pub mod fetcher;
pub mod frontier;
pub mod queue;
pub mod scheduler;
pub mod task;

// Re-export common types
pub use fetcher::{Fetcher, PageData};
pub use frontier::CrawlEngine;
pub use queue::{JobQueue, StatusSnapshot, Submission};
pub use scheduler::{JobTracker, RateLimiter};
pub use task::{Classification, CrawlTask, Job, JobStatus, JobTarget, PageRecord, Ticket};
