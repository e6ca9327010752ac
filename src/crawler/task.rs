use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crawler::scheduler::JobTracker;

/// A single unit of crawl work: one URL at one depth in a job's subtree.
#[derive(Debug, Clone)]
pub struct CrawlTask {
    /// URL to fetch and process
    pub url: String,

    /// Current depth in the crawl tree (0 for seed URLs)
    pub depth: u32,
}

/// Classification metadata produced once per job root and inherited by
/// every descendant page of that job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    /// ISO 2-letter country code, e.g. "DE"
    pub country: String,

    /// City token, whitespace replaced by hyphens
    pub city: String,

    /// Category token, e.g. "Government", "Tourism"
    pub category: String,
}

impl Classification {
    /// Fixed classification used when the classifier is unavailable or fails.
    pub fn fallback() -> Self {
        Self {
            country: "DE".to_string(),
            city: "Unknown".to_string(),
            category: "General".to_string(),
        }
    }
}

/// Page metadata extracted from markup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageMeta {
    pub title: String,
    pub description: String,
    pub keywords: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub og_title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub og_image: Option<String>,
}

/// A fully processed page as persisted into the corpus. Immutable once
/// written; field names match the on-disk JSON layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageRecord {
    pub url: String,
    pub title: String,
    pub description: String,
    pub content_markdown: String,
    pub meta: PageMeta,
    pub word_count: usize,
    pub ai_classification: Classification,
    pub crawled_at: DateTime<Utc>,
}

/// What a job crawls: a city name to be resolved through domain discovery,
/// or a pre-resolved seed URL (community submissions and re-crawls).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobTarget {
    City { name: String },
    Seed { url: String, category: String },
}

impl JobTarget {
    /// Human-readable label used in log lines and events.
    pub fn label(&self) -> &str {
        match self {
            JobTarget::City { name } => name,
            JobTarget::Seed { url, .. } => url,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Discovering,
    Crawling,
    CrawlingUpdate,
    Failed(String),
}

/// Set of URLs already scheduled for fetch, scoped to one job.
///
/// The check-and-insert is atomic: a URL is claimed before its task is
/// spawned, so two concurrently discovered references to the same URL can
/// never both be scheduled.
#[derive(Debug, Default)]
pub struct VisitedSet {
    inner: Mutex<HashSet<String>>,
}

impl VisitedSet {
    /// Claim a URL. Returns false if it was already claimed.
    pub fn insert(&self, url: &str) -> bool {
        self.inner
            .lock()
            .expect("visited set lock poisoned")
            .insert(url.to_string())
    }

    pub fn contains(&self, url: &str) -> bool {
        self.inner
            .lock()
            .expect("visited set lock poisoned")
            .contains(url)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("visited set lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An admitted crawl job. Shared between the orchestrator, the frontier
/// workers and the status API, so every mutable field is synchronized.
#[derive(Debug)]
pub struct Job {
    pub ticket_id: u64,
    pub target: JobTarget,
    status: Mutex<JobStatus>,
    pub pages_crawled: AtomicU64,
    pub cached_classification: Mutex<Option<Classification>>,
    pub visited: VisitedSet,
    pub tracker: JobTracker,
    pub started_at: DateTime<Utc>,
}

impl Job {
    pub fn new(ticket_id: u64, target: JobTarget) -> Self {
        let status = match target {
            JobTarget::City { .. } => JobStatus::Discovering,
            JobTarget::Seed { .. } => JobStatus::CrawlingUpdate,
        };
        Self {
            ticket_id,
            target,
            status: Mutex::new(status),
            pages_crawled: AtomicU64::new(0),
            cached_classification: Mutex::new(None),
            visited: VisitedSet::default(),
            tracker: JobTracker::default(),
            started_at: Utc::now(),
        }
    }

    pub fn set_status(&self, status: JobStatus) {
        *self.status.lock().expect("job status lock poisoned") = status;
    }

    pub fn status(&self) -> JobStatus {
        self.status
            .lock()
            .expect("job status lock poisoned")
            .clone()
    }

    pub fn cached_classification(&self) -> Option<Classification> {
        self.cached_classification
            .lock()
            .expect("classification lock poisoned")
            .clone()
    }

    pub fn cache_classification(&self, classification: Classification) {
        *self
            .cached_classification
            .lock()
            .expect("classification lock poisoned") = Some(classification);
    }

    /// Snapshot for the status API.
    pub fn view(&self) -> JobView {
        JobView {
            ticket_id: self.ticket_id,
            target: self.target.clone(),
            status: self.status(),
            pages_crawled: self.pages_crawled.load(Ordering::SeqCst),
            started_at: self.started_at,
        }
    }
}

/// Serializable snapshot of an active job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobView {
    pub ticket_id: u64,
    pub target: JobTarget,
    pub status: JobStatus,
    pub pages_crawled: u64,
    pub started_at: DateTime<Utc>,
}

/// A queued request for crawl admission, ordered FIFO.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    pub ticket_id: u64,
    pub target: JobTarget,
    pub enqueued_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn visited_set_claims_once() {
        let visited = VisitedSet::default();
        assert!(visited.insert("https://example.de/"));
        assert!(!visited.insert("https://example.de/"));
        assert!(visited.contains("https://example.de/"));
        assert_eq!(visited.len(), 1);
    }

    #[test]
    fn visited_set_claims_once_under_concurrency() {
        use std::sync::Arc;

        let visited = Arc::new(VisitedSet::default());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let visited = Arc::clone(&visited);
            handles.push(std::thread::spawn(move || {
                (0..100)
                    .filter(|i| visited.insert(&format!("https://example.de/page{i}")))
                    .count()
            }));
        }
        let claimed: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        // Each of the 100 URLs is claimed by exactly one thread.
        assert_eq!(claimed, 100);
        assert_eq!(visited.len(), 100);
    }

    #[test]
    fn new_job_status_depends_on_target() {
        let city = Job::new(
            1,
            JobTarget::City {
                name: "Coburg".to_string(),
            },
        );
        assert_eq!(city.status(), JobStatus::Discovering);

        let seed = Job::new(
            2,
            JobTarget::Seed {
                url: "https://example.de".to_string(),
                category: "update".to_string(),
            },
        );
        assert_eq!(seed.status(), JobStatus::CrawlingUpdate);
    }

    #[test]
    fn fallback_classification_is_fixed() {
        let fallback = Classification::fallback();
        assert_eq!(fallback.country, "DE");
        assert_eq!(fallback.city, "Unknown");
        assert_eq!(fallback.category, "General");
    }

    #[test]
    fn job_status_serializes_snake_case() {
        let json = serde_json::to_string(&JobStatus::CrawlingUpdate).unwrap();
        assert_eq!(json, r#""crawling_update""#);

        let failed = serde_json::to_string(&JobStatus::Failed("no_domains_found".into())).unwrap();
        assert!(failed.contains("no_domains_found"));
    }
}
