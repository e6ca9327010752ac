use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::crawler::discovery;
use crate::crawler::frontier::CrawlEngine;
use crate::crawler::task::{CrawlTask, Job, JobStatus, JobTarget, JobView, Ticket};
use crate::events::{EventBus, EventKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmissionStatus {
    Started,
    Queued,
}

/// What a caller gets back for a submitted target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub ticket_id: u64,
    pub status: SubmissionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
}

/// Snapshot of the queue for the status API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub active: Vec<JobView>,
    pub queue: Vec<Ticket>,
}

#[derive(Default)]
struct QueueState {
    active: Option<Arc<Job>>,
    tickets: VecDeque<Ticket>,
}

/// Single-job-at-a-time admission queue.
///
/// Every submission gets a monotonically increasing ticket id. While a job
/// is active further tickets wait FIFO; when the active job's tracker
/// drains, the job is retired and the next ticket admitted. This is the
/// only owner of the active/queued state, so all transitions go through
/// one lock.
pub struct JobQueue {
    engine: Arc<CrawlEngine>,
    events: EventBus,
    next_ticket: AtomicU64,
    state: Mutex<QueueState>,
}

impl JobQueue {
    /// Queue events share the engine's bus so phase messages and per-page
    /// messages reach the same subscribers.
    pub fn new(engine: Arc<CrawlEngine>) -> Arc<Self> {
        let events = engine.events().clone();
        Arc::new(Self {
            engine,
            events,
            next_ticket: AtomicU64::new(0),
            state: Mutex::new(QueueState::default()),
        })
    }

    /// Submit a crawl target. Admits the job immediately when the active
    /// slot is free, otherwise queues a ticket and reports its position.
    pub fn submit(self: &Arc<Self>, target: JobTarget) -> Submission {
        let ticket_id = self.next_ticket.fetch_add(1, Ordering::SeqCst) + 1;
        let mut state = self.state.lock().expect("queue state lock poisoned");

        if state.active.is_some() {
            state.tickets.push_back(Ticket {
                ticket_id,
                target: target.clone(),
                enqueued_at: Utc::now(),
            });
            let position = state.tickets.len();
            info!(ticket_id, target = target.label(), position, "Ticket queued");
            Submission {
                ticket_id,
                status: SubmissionStatus::Queued,
                position: Some(position),
            }
        } else {
            self.admit(&mut state, ticket_id, target);
            Submission {
                ticket_id,
                status: SubmissionStatus::Started,
                position: None,
            }
        }
    }

    /// Mark the active slot taken and launch the job orchestrator.
    /// Caller must hold the state lock.
    fn admit(self: &Arc<Self>, state: &mut QueueState, ticket_id: u64, target: JobTarget) {
        info!(ticket_id, target = target.label(), "Admitting job");
        let job = Arc::new(Job::new(ticket_id, target));
        state.active = Some(Arc::clone(&job));

        let queue = Arc::clone(self);
        tokio::spawn(async move {
            queue.run_job(job).await;
        });
    }

    async fn run_job(self: &Arc<Self>, job: Arc<Job>) {
        match job.target.clone() {
            JobTarget::City { name } => {
                self.events.emit(
                    EventKind::Info,
                    format!("Initializing discovery for target: {name}"),
                );
                let seeds = discovery::discover_domains(self.engine.fetcher(), &name).await;

                if seeds.is_empty() {
                    warn!(city = %name, "Discovery found no reachable domains");
                    job.set_status(JobStatus::Failed("no_domains_found".to_string()));
                    self.events
                        .emit(EventKind::Error, format!("No domains found for {name}"));
                    self.finish_job(&job);
                    return;
                }

                self.events.emit(
                    EventKind::Success,
                    format!(
                        "Discovery complete. Found {} candidate domains.",
                        seeds.len()
                    ),
                );
                job.set_status(JobStatus::Crawling);
                for url in seeds {
                    self.engine.spawn_task(CrawlTask { url, depth: 0 }, &job);
                }
            }
            JobTarget::Seed { url, .. } => {
                self.engine
                    .spawn_task(CrawlTask { url, depth: 0 }, &job);
            }
        }

        job.tracker.drained().await;

        let pages = job.pages_crawled.load(Ordering::SeqCst);
        info!(ticket_id = job.ticket_id, pages, "Job drained");
        self.events.emit(
            EventKind::Success,
            format!("Job #{} finished: {pages} pages indexed", job.ticket_id),
        );
        self.finish_job(&job);
    }

    /// Retire a job and admit the next queued ticket, FIFO.
    fn finish_job(self: &Arc<Self>, job: &Arc<Job>) {
        let mut state = self.state.lock().expect("queue state lock poisoned");

        match &state.active {
            Some(active) if active.ticket_id == job.ticket_id => state.active = None,
            _ => return, // a later job already took over the slot
        }

        if let Some(ticket) = state.tickets.pop_front() {
            self.admit(&mut state, ticket.ticket_id, ticket.target);
        }
    }

    pub fn status_snapshot(&self) -> StatusSnapshot {
        let state = self.state.lock().expect("queue state lock poisoned");
        StatusSnapshot {
            active: state.active.iter().map(|job| job.view()).collect(),
            queue: state.tickets.iter().cloned().collect(),
        }
    }

    pub fn active_count(&self) -> usize {
        let state = self.state.lock().expect("queue state lock poisoned");
        state.active.is_some() as usize + state.tickets.len()
    }
}
