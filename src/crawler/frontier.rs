use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};
use url::Url;

use crate::classify::Classifier;
use crate::cli::config::CrawlSettings;
use crate::crawler::fetcher::{Fetcher, PageData};
use crate::crawler::scheduler::RateLimiter;
use crate::crawler::task::{Classification, CrawlTask, Job, PageRecord};
use crate::events::{EventBus, EventKind};
use crate::storage::CorpusStorage;

/// The recursive crawl traversal.
///
/// Work is distributed as spawned tasks gated by one shared [`RateLimiter`];
/// each processed page persists its record and feeds newly discovered links
/// back in as deeper tasks. A node's failure never propagates past its own
/// branch.
pub struct CrawlEngine {
    fetcher: Fetcher,
    classifier: Option<Arc<dyn Classifier>>,
    storage: CorpusStorage,
    events: EventBus,
    limiter: Arc<RateLimiter>,
    settings: CrawlSettings,
}

impl CrawlEngine {
    pub fn new(
        fetcher: Fetcher,
        classifier: Option<Arc<dyn Classifier>>,
        storage: CorpusStorage,
        events: EventBus,
        limiter: Arc<RateLimiter>,
        settings: CrawlSettings,
    ) -> Self {
        Self {
            fetcher,
            classifier,
            storage,
            events,
            limiter,
            settings,
        }
    }

    pub fn fetcher(&self) -> &Fetcher {
        &self.fetcher
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Schedule one URL of a job's subtree.
    ///
    /// The URL is claimed in the job's visited set *before* the task is
    /// spawned, so concurrent discovery of the same URL from multiple
    /// parents schedules exactly one fetch. Claimed tasks are registered
    /// with the job tracker first; the tracker therefore only drains once
    /// the whole subtree has finished.
    pub fn spawn_task(self: &Arc<Self>, task: CrawlTask, job: &Arc<Job>) {
        if task.depth > self.settings.max_depth {
            return;
        }
        if !job.visited.insert(&task.url) {
            return;
        }

        job.tracker.task_started();
        let engine = Arc::clone(self);
        let job = Arc::clone(job);
        tokio::spawn(async move {
            let permit = engine.limiter.acquire().await;
            engine.process(&task, &job).await;
            drop(permit);
            job.tracker.task_finished();
        });
    }

    async fn process(self: &Arc<Self>, task: &CrawlTask, job: &Arc<Job>) {
        debug!(url = %task.url, depth = task.depth, "Processing node");
        self.events.emit(
            EventKind::Crawl,
            format!("[Depth {}] Fetching: {}", task.depth, task.url),
        );

        let Some(page) = self.fetcher.fetch_page(&task.url).await else {
            self.events
                .emit(EventKind::Error, format!("Failed to fetch: {}", task.url));
            return;
        };

        let word_count = page.markdown.split_whitespace().count();
        let classification = self.classification_for(task, job, &page).await;

        let title = if page.meta.title.is_empty() {
            "Untitled".to_string()
        } else {
            page.meta.title.clone()
        };
        let record = PageRecord {
            url: page.url.clone(),
            title: title.clone(),
            description: page.meta.description.clone(),
            content_markdown: page.markdown.clone(),
            meta: page.meta.clone(),
            word_count,
            ai_classification: classification.clone(),
            crawled_at: Utc::now(),
        };

        match self.storage.save_page(&classification, &record) {
            Ok(_) => {
                job.pages_crawled.fetch_add(1, Ordering::SeqCst);
                self.events.emit(
                    EventKind::Save,
                    format!("Indexed: {title} [{word_count} words]"),
                );
            }
            Err(err) => {
                warn!(url = %task.url, error = %err, "Failed to persist page");
                self.events
                    .emit(EventKind::Error, format!("Failed to save: {}", task.url));
            }
        }

        if task.depth < self.settings.max_depth {
            self.queue_subpages(task, job, &page);
        }
        if task.depth < self.settings.hub_depth {
            self.spider_external(task, job, &page);
        }
    }

    /// One classification call per job root: depth 0 asks the classifier and
    /// caches the result on the job; deeper nodes inherit the cache, falling
    /// back to the fixed default when it is absent.
    async fn classification_for(
        &self,
        task: &CrawlTask,
        job: &Arc<Job>,
        page: &PageData,
    ) -> Classification {
        if task.depth > 0 {
            return job
                .cached_classification()
                .unwrap_or_else(Classification::fallback);
        }

        if let Some(classifier) = &self.classifier {
            self.events.emit(
                EventKind::Ai,
                format!("Classifying context for {}", task.url),
            );
            let started = std::time::Instant::now();
            match classifier.classify(&page.markdown, &task.url).await {
                Ok(classification) => {
                    self.events.emit(
                        EventKind::AiSuccess,
                        format!(
                            "Classification ({}ms): {} | {}, {}",
                            started.elapsed().as_millis(),
                            classification.category,
                            classification.city,
                            classification.country
                        ),
                    );
                    job.cache_classification(classification.clone());
                    return classification;
                }
                Err(err) => {
                    warn!(url = %task.url, error = %err, "Classification failed, using fallback");
                    self.events.emit(
                        EventKind::Error,
                        format!("Classification failed for {}: {err}", task.url),
                    );
                }
            }
        }

        let fallback = Classification::fallback();
        job.cache_classification(fallback.clone());
        fallback
    }

    /// Queue subpages at depth+1: every structural (nav/footer) link first,
    /// then a capped number of the remaining body links. Structural links
    /// are a stronger signal of being genuine subpages than arbitrary body
    /// links, so they bypass the cap.
    fn queue_subpages(self: &Arc<Self>, task: &CrawlTask, job: &Arc<Job>, page: &PageData) {
        let mut priority: Vec<&String> = Vec::new();
        let mut structural: HashSet<&str> = HashSet::new();
        for link in page.nav_links.iter().chain(page.footer_links.iter()) {
            if structural.insert(link.as_str()) {
                priority.push(link);
            }
        }
        if !priority.is_empty() {
            self.events.emit(
                EventKind::Info,
                format!(
                    "Found {} structural links (nav/footer) to prioritize",
                    priority.len()
                ),
            );
        }
        for link in priority {
            self.spawn_task(
                CrawlTask {
                    url: link.clone(),
                    depth: task.depth + 1,
                },
                job,
            );
        }

        let mut queued = 0;
        for link in &page.internal_links {
            if structural.contains(link.as_str()) {
                continue;
            }
            if queued >= self.settings.body_link_cap {
                break;
            }
            queued += 1;
            self.spawn_task(
                CrawlTask {
                    url: link.clone(),
                    depth: task.depth + 1,
                },
                job,
            );
        }
    }

    /// Bounded external spidering from hub pages: a nearby municipality or
    /// local business linked from a city portal is likely relevant, so a
    /// handful of external links matching the target country TLD are
    /// scheduled as new depth-1 subtrees. Depth 1 (not 0) keeps breadth in
    /// check and avoids a fresh classification call per spidered site.
    fn spider_external(self: &Arc<Self>, task: &CrawlTask, job: &Arc<Job>, page: &PageData) {
        let mut considered = 0;
        for link in &page.external_links {
            if considered >= self.settings.external_link_cap {
                break;
            }
            considered += 1;

            let Ok(parsed) = Url::parse(link) else {
                continue;
            };
            let Some(host) = parsed.host_str() else {
                continue;
            };
            if self
                .settings
                .domain_blocklist
                .iter()
                .any(|blocked| host.contains(blocked.as_str()))
            {
                continue;
            }
            if !host.ends_with(&self.settings.country_tld) {
                continue;
            }

            debug!(url = %link, "Spider found potential local site");
            self.spawn_task(
                CrawlTask {
                    url: link.clone(),
                    depth: 1,
                },
                job,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::config::CrawlerConfig;
    use crate::crawler::fetcher::BOT_USER_AGENT;
    use crate::crawler::task::JobTarget;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct StubClassifier {
        classification: Classification,
    }

    #[async_trait]
    impl Classifier for StubClassifier {
        async fn classify(&self, _content: &str, _url: &str) -> Result<Classification> {
            Ok(self.classification.clone())
        }
    }

    struct FailingClassifier;

    #[async_trait]
    impl Classifier for FailingClassifier {
        async fn classify(&self, _content: &str, _url: &str) -> Result<Classification> {
            anyhow::bail!("model unavailable")
        }
    }

    fn stub() -> Arc<dyn Classifier> {
        Arc::new(StubClassifier {
            classification: Classification {
                country: "DE".to_string(),
                city: "Coburg".to_string(),
                category: "Government".to_string(),
            },
        })
    }

    fn engine_for(
        dir: &tempfile::TempDir,
        classifier: Option<Arc<dyn Classifier>>,
        max_depth: u32,
    ) -> Arc<CrawlEngine> {
        let mut settings = CrawlerConfig::default().crawler;
        settings.max_depth = max_depth;
        // Test pages link within the mock server, which serves from 127.0.0.1.
        settings.country_tld = String::new();
        settings.domain_blocklist = vec![];

        Arc::new(CrawlEngine::new(
            Fetcher::new(BOT_USER_AGENT).unwrap(),
            classifier,
            CorpusStorage::new(dir.path()).unwrap(),
            EventBus::default(),
            Arc::new(RateLimiter::new(5, Duration::from_millis(1))),
            settings,
        ))
    }

    fn page(body: &str) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_string(format!(
            "<html><head><title>t</title></head><body>{body}</body></html>"
        ))
    }

    async fn run_seed(engine: &Arc<CrawlEngine>, url: String) -> Arc<Job> {
        let job = Arc::new(Job::new(
            1,
            JobTarget::Seed {
                url: url.clone(),
                category: "test".to_string(),
            },
        ));
        engine.spawn_task(CrawlTask { url, depth: 0 }, &job);
        job.tracker.drained().await;
        job
    }

    fn all_records(dir: &tempfile::TempDir) -> Vec<PageRecord> {
        let mut records = Vec::new();
        for entry in std::fs::read_dir(dir.path()).unwrap() {
            let contents = std::fs::read_to_string(entry.unwrap().path()).unwrap();
            let file: crate::storage::corpus::CorpusFile =
                serde_json::from_str(&contents).unwrap();
            records.extend(file.pages);
        }
        records
    }

    #[tokio::test]
    async fn footer_links_are_scheduled_via_priority_path() {
        let server = MockServer::start().await;
        Mock::given(method("GET")).and(path("/")).respond_with(page(
            r#"<p>Start</p>
               <footer><a href="/fuss-a">A</a><a href="/fuss-b">B</a></footer>"#,
        ))
        .mount(&server)
        .await;
        Mock::given(method("GET"))
            .and(path("/fuss-a"))
            .respond_with(page("<p>A</p>"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/fuss-b"))
            .respond_with(page("<p>B</p>"))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let engine = engine_for(&dir, Some(stub()), 2);
        let job = run_seed(&engine, format!("{}/", server.uri())).await;

        // Both footer-only links were crawled even though neither appears in
        // the body, and each URL exactly once.
        assert_eq!(job.pages_crawled.load(Ordering::SeqCst), 3);
        let urls: Vec<String> = all_records(&dir).into_iter().map(|r| r.url).collect();
        assert!(urls.iter().any(|u| u.ends_with("/fuss-a")));
        assert!(urls.iter().any(|u| u.ends_with("/fuss-b")));
        assert_eq!(urls.len(), 3);
    }

    #[tokio::test]
    async fn depth_bound_is_respected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(page(r#"<a href="/eins">1</a>"#))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/eins"))
            .respond_with(page(r#"<a href="/zwei">2</a>"#))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/zwei"))
            .respond_with(page(r#"<a href="/drei">3</a>"#))
            .expect(0)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let engine = engine_for(&dir, Some(stub()), 1);
        let job = run_seed(&engine, format!("{}/", server.uri())).await;

        // max_depth 1: the seed and its direct children only.
        assert_eq!(job.pages_crawled.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn each_url_is_fetched_once_despite_multiple_parents() {
        let server = MockServer::start().await;
        Mock::given(method("GET")).and(path("/")).respond_with(page(
            r#"<nav><a href="/ziel">Ziel</a></nav>
               <a href="/ziel">Ziel nochmal</a>
               <footer><a href="/ziel">Ziel im Fuss</a></footer>"#,
        ))
        .mount(&server)
        .await;
        Mock::given(method("GET"))
            .and(path("/ziel"))
            .respond_with(page("<p>Ziel</p>"))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let engine = engine_for(&dir, Some(stub()), 2);
        let job = run_seed(&engine, format!("{}/", server.uri())).await;

        assert_eq!(job.pages_crawled.load(Ordering::SeqCst), 2);
        assert_eq!(job.visited.len(), 2);
    }

    #[tokio::test]
    async fn descendants_inherit_root_classification() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(page(r#"<a href="/unter">Unterseite</a>"#))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/unter"))
            .respond_with(page("<p>Unterseite</p>"))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let engine = engine_for(&dir, Some(stub()), 2);
        run_seed(&engine, format!("{}/", server.uri())).await;

        let records = all_records(&dir);
        assert_eq!(records.len(), 2);
        for record in records {
            assert_eq!(record.ai_classification.city, "Coburg");
            assert_eq!(record.ai_classification.category, "Government");
        }
    }

    #[tokio::test]
    async fn classifier_failure_falls_back_and_crawl_continues() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(page(r#"<a href="/unter">Unterseite</a>"#))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/unter"))
            .respond_with(page("<p>Unterseite</p>"))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let engine = engine_for(&dir, Some(Arc::new(FailingClassifier)), 2);
        let job = run_seed(&engine, format!("{}/", server.uri())).await;

        assert_eq!(job.pages_crawled.load(Ordering::SeqCst), 2);
        for record in all_records(&dir) {
            assert_eq!(record.ai_classification, Classification::fallback());
        }
    }

    #[tokio::test]
    async fn failed_branch_does_not_abort_siblings() {
        let server = MockServer::start().await;
        Mock::given(method("GET")).and(path("/")).respond_with(page(
            r#"<nav><a href="/kaputt">Kaputt</a><a href="/heil">Heil</a></nav>"#,
        ))
        .mount(&server)
        .await;
        Mock::given(method("GET"))
            .and(path("/heil"))
            .respond_with(page("<p>Heil</p>"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/kaputt"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let engine = engine_for(&dir, Some(stub()), 2);
        let job = run_seed(&engine, format!("{}/", server.uri())).await;

        // Root and the healthy sibling; the broken branch just dies.
        assert_eq!(job.pages_crawled.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn body_links_beyond_cap_are_not_queued() {
        let server = MockServer::start().await;
        let links: String = (0..8)
            .map(|i| format!(r#"<a href="/seite-{i}">S{i}</a>"#))
            .collect();
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(page(&links))
            .mount(&server)
            .await;
        for i in 0..8 {
            Mock::given(method("GET"))
                .and(path(format!("/seite-{i}")))
                .respond_with(page("<p>Seite</p>"))
                .mount(&server)
                .await;
        }

        let dir = tempfile::tempdir().unwrap();
        let engine = engine_for(&dir, Some(stub()), 1);
        let job = run_seed(&engine, format!("{}/", server.uri())).await;

        // Seed plus at most body_link_cap (5) body links.
        assert_eq!(job.pages_crawled.load(Ordering::SeqCst), 6);
    }
}
