use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

use crate::classify::{Classifier, OllamaClassifier};
use crate::cli::config::CrawlerConfig;
use crate::crawler::scheduler::RateLimiter;
use crate::crawler::task::{CrawlTask, Job, JobStatus, JobTarget};
use crate::crawler::{discovery, CrawlEngine, Fetcher, JobQueue};
use crate::events::EventBus;
use crate::server::{self, AppState};
use crate::storage::CorpusStorage;

/// Wire the crawl engine from configuration. Shared by the server and
/// the one-shot crawl command.
fn build_engine(config: &CrawlerConfig, events: EventBus) -> Result<Arc<CrawlEngine>> {
    let fetcher = Fetcher::new(&config.crawler.user_agent)?;
    let storage = CorpusStorage::new(&config.storage.data_dir)?;
    let limiter = Arc::new(RateLimiter::new(
        config.scheduler.max_concurrent,
        Duration::from_millis(config.scheduler.min_interval_ms),
    ));

    let classifier: Option<Arc<dyn Classifier>> = if config.classifier.enabled {
        Some(Arc::new(OllamaClassifier::new(&config.classifier)?))
    } else {
        info!("AI classification disabled, using fallback labels");
        None
    };

    Ok(Arc::new(CrawlEngine::new(
        fetcher,
        classifier,
        storage,
        events,
        limiter,
        config.crawler.clone(),
    )))
}

/// Run the control API server
pub async fn serve(host: Option<String>, port: Option<u16>) -> Result<()> {
    let config = CrawlerConfig::load_default()?;

    let host = host.unwrap_or_else(|| config.server.host.clone());
    let port = port.unwrap_or(config.server.port);
    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .with_context(|| format!("Invalid bind address: {}:{}", host, port))?;

    let events = EventBus::default();
    let engine = build_engine(&config, events.clone())?;
    let storage = CorpusStorage::new(&config.storage.data_dir)?;
    let queue = JobQueue::new(engine);

    let state = AppState {
        queue,
        storage,
        events,
        stale_after_days: config.update.stale_after_days,
    };

    server::serve(state, addr).await
}

/// Discover and crawl a single city, waiting for the frontier to drain
pub async fn crawl(city: String, depth: Option<u32>) -> Result<()> {
    let mut config = CrawlerConfig::load_default()?;
    if let Some(depth) = depth {
        config.crawler.max_depth = depth;
    }

    let events = EventBus::default();
    let engine = build_engine(&config, events.clone())?;

    info!("Discovering domains for {}", city);
    let domains = discovery::discover_domains(engine.fetcher(), &city).await;
    if domains.is_empty() {
        bail!("No reachable domains found for {}", city);
    }
    info!("Found {} domain(s): {}", domains.len(), domains.join(", "));

    let job = Arc::new(Job::new(0, JobTarget::City { name: city }));
    job.set_status(JobStatus::Crawling);
    for domain in domains {
        engine.spawn_task(CrawlTask { url: domain, depth: 0 }, &job);
    }
    job.tracker.drained().await;

    let pages = job.pages_crawled.load(Ordering::SeqCst);
    if pages == 0 {
        warn!("Crawl finished without saving any pages");
    } else {
        info!("Crawl finished, {} page(s) saved", pages);
    }
    Ok(())
}

/// Print the active configuration as YAML
pub fn show_config() -> Result<()> {
    let config = CrawlerConfig::load_default()?;
    println!("{}", serde_yaml::to_string(&config)?);
    Ok(())
}
