use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::bus::{
    topics, CommandPayload, EventPayload, InboundEvent, MessageBus, NodeCommand, OutputStream,
    QueryAck, QueryResponse,
};
use crate::config::{to_chrono, DispatchConfig};
use crate::dispatch::aggregate::{aggregate, JobStatus, RunBreakdown};
use crate::dispatch::job::{Job, SubmitRequest};
use crate::dispatch::quorum::check_quorum;
use crate::dispatch::resolve::TargetResolver;
use crate::dispatch::run::{JobNodeRun, OutputChunk, RunState};
use crate::error::{Result, ShoveyError};
use crate::liveness::LivenessMonitor;
use crate::signing::{seal, PayloadSigner};
use crate::store::StateStore;

type SharedStore = Option<Arc<dyn StateStore>>;

/// One node's run behind its own lock. Waiters on `changed` are woken after
/// every applied update.
struct RunCell {
    run: Mutex<JobNodeRun>,
    changed: Notify,
}

impl RunCell {
    fn new(run: JobNodeRun) -> Self {
        Self {
            run: Mutex::new(run),
            changed: Notify::new(),
        }
    }

    /// Apply `f` under the run lock. When it reports a change the run is
    /// written through to the store and waiters are woken.
    async fn update<F>(&self, store: &SharedStore, f: F) -> bool
    where
        F: FnOnce(&mut JobNodeRun) -> bool,
    {
        let mut run = self.run.lock().await;
        let changed = f(&mut run);
        if changed {
            if let Some(store) = store {
                if let Err(e) = store.save_run(&run).await {
                    tracing::error!(job_id = %run.job_id, node = %run.node, error = %e, "Failed to save run");
                }
            }
            drop(run);
            self.changed.notify_waiters();
        }
        changed
    }

    async fn snapshot(&self) -> JobNodeRun {
        self.run.lock().await.clone()
    }

    async fn state(&self) -> RunState {
        self.run.lock().await.state
    }
}

struct JobRecord {
    job: Job,
    cancelled: AtomicBool,
    /// Set once every run has ended
    settled: AtomicBool,
    runs: BTreeMap<String, Arc<RunCell>>,
}

impl JobRecord {
    fn new(job: Job, runs: impl IntoIterator<Item = JobNodeRun>) -> Self {
        let cancelled = AtomicBool::new(job.cancelled);
        let runs = runs
            .into_iter()
            .map(|run| (run.node.clone(), Arc::new(RunCell::new(run))))
            .collect();
        Self {
            job,
            cancelled,
            settled: AtomicBool::new(false),
            runs,
        }
    }

    /// True once every run is terminal. Runs never leave a terminal state,
    /// so a positive answer is remembered.
    async fn is_settled(&self) -> bool {
        if self.settled.load(Ordering::SeqCst) {
            return true;
        }
        for cell in self.runs.values() {
            if !cell.state().await.is_terminal() {
                return false;
            }
        }
        self.settled.store(true, Ordering::SeqCst);
        true
    }

    fn job(&self) -> Job {
        let mut job = self.job.clone();
        job.cancelled = self.cancelled.load(Ordering::SeqCst);
        job
    }

    async fn states(&self) -> Vec<RunState> {
        let mut states = Vec::with_capacity(self.runs.len());
        for cell in self.runs.values() {
            states.push(cell.state().await);
        }
        states
    }

    async fn status(&self) -> (JobStatus, RunBreakdown) {
        aggregate(self.job.quorum_failed, self.states().await)
    }
}

/// What happened to an inbound run event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    /// The event changed a run
    Applied,
    /// The event was valid but changed nothing, e.g. a duplicate chunk
    Ignored,
    /// The event was malformed or named an unknown run
    Discarded,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CancelOutcome {
    /// Runs moved to `cancelled` by this request
    pub cancelled: Vec<String>,
    /// Runs that had already ended and were left alone
    pub already_terminal: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub node: String,
    pub state: RunState,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl From<&JobNodeRun> for RunSummary {
    fn from(run: &JobNodeRun) -> Self {
        Self {
            node: run.node.clone(),
            state: run.state,
            exit_code: run.exit_code,
            error: run.error.clone(),
            started_at: run.started_at,
            ended_at: run.ended_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    #[serde(flatten)]
    pub job: Job,
    pub status: JobStatus,
    pub breakdown: RunBreakdown,
    pub nodes: Vec<RunSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub id: Uuid,
    pub command: String,
    pub submitted_at: DateTime<Utc>,
    pub target_count: usize,
    pub status: JobStatus,
    pub breakdown: RunBreakdown,
}

#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub offset: usize,
    /// `None` returns every remaining job
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobPage {
    pub jobs: Vec<JobSummary>,
    /// Jobs matching the filter before pagination
    pub total: usize,
    pub has_more: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunDetail {
    #[serde(flatten)]
    pub run: JobNodeRun,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutputBatch {
    pub chunks: Vec<OutputChunk>,
    /// Highest sequence number stored so far
    pub last_sequence: Option<u64>,
    /// The run has ended
    pub is_last: bool,
}

/// Owns the job table and drives every job from submission to completion.
///
/// Each run sits behind its own lock, so events for different nodes never
/// contend. The job table lock is only held to look up or insert records and
/// never across bus calls.
pub struct Dispatcher {
    config: DispatchConfig,
    monitor: Arc<LivenessMonitor>,
    bus: Arc<dyn MessageBus>,
    signer: Arc<dyn PayloadSigner>,
    resolver: Arc<dyn TargetResolver>,
    store: SharedStore,
    jobs: RwLock<HashMap<Uuid, Arc<JobRecord>>>,
}

impl Dispatcher {
    pub fn new(
        config: DispatchConfig,
        monitor: Arc<LivenessMonitor>,
        bus: Arc<dyn MessageBus>,
        signer: Arc<dyn PayloadSigner>,
        resolver: Arc<dyn TargetResolver>,
    ) -> Self {
        Self {
            config,
            monitor,
            bus,
            signer,
            resolver,
            store: None,
            jobs: RwLock::new(HashMap::new()),
        }
    }

    /// Write jobs and runs through to `store`.
    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Load every job saved in the store into the job table. Runs that were
    /// still going keep their original deadline. When the store holds more
    /// than `max_jobs`, the oldest finished jobs are dropped. Returns the
    /// number of jobs in the table afterwards.
    pub async fn restore(&self) -> Result<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let stored = store.load_jobs().await?;
        let mut jobs = self.jobs.write().await;
        for entry in &stored {
            let record = JobRecord::new(entry.job.clone(), entry.runs.values().cloned());
            jobs.insert(entry.job.id, Arc::new(record));
        }

        let excess = jobs.len().saturating_sub(self.config.max_jobs);
        if excess > 0 {
            self.evict_settled(&mut jobs, excess).await;
            if jobs.len() > self.config.max_jobs {
                tracing::warn!(
                    jobs = jobs.len(),
                    max_jobs = self.config.max_jobs,
                    "Restored more unfinished jobs than the job table holds"
                );
            }
        }
        tracing::info!(jobs = jobs.len(), "Restored jobs");
        Ok(jobs.len())
    }

    /// Validate, quorum-check, sign and fan out a job.
    ///
    /// Input problems are returned as errors and create nothing. A quorum
    /// that is not met is not an error: the job is recorded as
    /// `quorum_failed` with no runs and nothing is sent.
    pub async fn submit(&self, request: SubmitRequest) -> Result<Job> {
        if request.command.trim().is_empty() {
            return Err(ShoveyError::EmptyCommand);
        }
        let run_timeout = request
            .run_timeout
            .unwrap_or(self.config.default_run_timeout);
        if run_timeout.is_zero() {
            return Err(ShoveyError::InvalidTimeout);
        }

        let targets = self.resolver.resolve(&request.targets).await?;
        if targets.is_empty() {
            return Err(ShoveyError::EmptyTargets);
        }
        let check = check_quorum(&self.monitor, &targets, request.quorum).await?;
        let mut job = Job::new(
            request.command,
            targets,
            request.quorum,
            run_timeout,
            Utc::now(),
        );
        job.up_at_submission = check.up_count;

        if !check.satisfied {
            job.quorum_failed = true;
            tracing::info!(
                job_id = %job.id,
                up = check.up_count,
                required = check.required,
                total = check.total,
                "Quorum not met, job not dispatched"
            );
            self.insert(JobRecord::new(job.clone(), Vec::<JobNodeRun>::new()))
                .await?;
            return Ok(job);
        }

        let payload = CommandPayload {
            command: NodeCommand::Start {
                job_id: job.id,
                command: job.command.clone(),
                run_timeout_ms: job.run_timeout_ms,
            },
            issued_at: job.submitted_at,
            expires_at: job.deadline(),
        };
        let envelope = seal(self.signer.as_ref(), &payload, job.deadline())?.to_bytes()?;

        let runs = job
            .targets
            .iter()
            .map(|node| JobNodeRun::new(job.id, node.clone(), job.submitted_at));
        let record = self.insert(JobRecord::new(job.clone(), runs)).await?;

        tracing::info!(
            job_id = %job.id,
            command = %job.command,
            targets = job.targets.len(),
            up = check.up_count,
            "Dispatching job"
        );

        match self.bus.query(topics::JOB, envelope, &job.targets).await {
            Ok(acks) => {
                tokio::spawn(collect_acks(record, acks, self.store.clone()));
            }
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "Job query failed, marking every run nacked");
                let now = Utc::now();
                let reason = e.to_string();
                for cell in record.runs.values() {
                    cell.update(&self.store, |run| run.reject(reason.clone(), now))
                        .await;
                }
            }
        }

        Ok(job)
    }

    /// Add a job to the table, making room by evicting the oldest finished
    /// jobs when it is full. The capacity check and the insert share one
    /// write guard.
    async fn insert(&self, record: JobRecord) -> Result<Arc<JobRecord>> {
        let mut jobs = self.jobs.write().await;
        if jobs.len() >= self.config.max_jobs {
            let excess = jobs.len() + 1 - self.config.max_jobs;
            self.evict_settled(&mut jobs, excess).await;
            if jobs.len() >= self.config.max_jobs {
                tracing::warn!(max_jobs = self.config.max_jobs, "Job table full of unfinished jobs");
                return Err(ShoveyError::JobTableFull);
            }
        }

        if let Some(store) = &self.store {
            if let Err(e) = store.save_job(&record.job).await {
                tracing::error!(job_id = %record.job.id, error = %e, "Failed to save job");
            }
            for cell in record.runs.values() {
                let run = cell.snapshot().await;
                if let Err(e) = store.save_run(&run).await {
                    tracing::error!(job_id = %run.job_id, node = %run.node, error = %e, "Failed to save run");
                }
            }
        }
        let record = Arc::new(record);
        jobs.insert(record.job.id, record.clone());
        Ok(record)
    }

    /// Remove up to `count` finished jobs, oldest first, from the table and
    /// the store.
    async fn evict_settled(&self, jobs: &mut HashMap<Uuid, Arc<JobRecord>>, count: usize) -> usize {
        let mut settled = Vec::new();
        for record in jobs.values() {
            if record.is_settled().await {
                settled.push((record.job.submitted_at, record.job.id));
            }
        }
        settled.sort();

        let mut evicted = 0;
        for (_, job_id) in settled.into_iter().take(count) {
            jobs.remove(&job_id);
            if let Some(store) = &self.store {
                if let Err(e) = store.delete_job(job_id).await {
                    tracing::error!(job_id = %job_id, error = %e, "Failed to delete evicted job");
                }
            }
            tracing::debug!(job_id = %job_id, "Evicted finished job");
            evicted += 1;
        }
        evicted
    }

    async fn record(&self, job_id: Uuid) -> Result<Arc<JobRecord>> {
        self.jobs
            .read()
            .await
            .get(&job_id)
            .cloned()
            .ok_or(ShoveyError::JobNotFound(job_id))
    }

    async fn cell(&self, job_id: Uuid, node: &str) -> Result<Arc<RunCell>> {
        self.record(job_id)
            .await?
            .runs
            .get(node)
            .cloned()
            .ok_or_else(|| ShoveyError::RunNotFound {
                job_id,
                node: node.to_string(),
            })
    }

    /// Apply a raw run-report or output event from the bus.
    pub async fn handle_inbound(&self, raw: &[u8]) -> EventOutcome {
        let event = match InboundEvent::from_bytes(raw) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, "Discarding malformed run event");
                return EventOutcome::Discarded;
            }
        };
        self.handle_event(event).await
    }

    pub async fn handle_event(&self, event: InboundEvent) -> EventOutcome {
        let InboundEvent {
            node,
            job_id,
            timestamp,
            sequence,
            payload,
        } = event;

        if matches!(payload, EventPayload::Heartbeat) {
            return EventOutcome::Ignored;
        }
        let Some(job_id) = job_id else {
            tracing::warn!(node = %node, "Discarding run event without a job id");
            return EventOutcome::Discarded;
        };
        let cell = match self.cell(job_id, &node).await {
            Ok(cell) => cell,
            Err(_) => {
                tracing::warn!(job_id = %job_id, node = %node, "Discarding event for unknown run");
                return EventOutcome::Discarded;
            }
        };

        let now = Utc::now();
        match payload {
            EventPayload::RunReport(report) => {
                let mut applied = false;
                cell.update(&self.store, |run| {
                    applied = run.complete(&report, now);
                    true
                })
                .await;
                if applied {
                    tracing::info!(job_id = %job_id, node = %node, status = %report.status, exit_code = ?report.exit_code, "Run finished");
                    EventOutcome::Applied
                } else {
                    tracing::debug!(job_id = %job_id, node = %node, "Kept late run report");
                    EventOutcome::Ignored
                }
            }
            EventPayload::Output { stream, data } => {
                let Some(sequence) = sequence else {
                    tracing::warn!(job_id = %job_id, node = %node, "Discarding output chunk without a sequence number");
                    return EventOutcome::Discarded;
                };
                let stored = cell
                    .update(&self.store, |run| {
                        run.append_output(sequence, stream, data, timestamp)
                    })
                    .await;
                if stored {
                    EventOutcome::Applied
                } else {
                    tracing::debug!(job_id = %job_id, node = %node, sequence, "Duplicate output chunk");
                    EventOutcome::Ignored
                }
            }
            EventPayload::Heartbeat => EventOutcome::Ignored,
        }
    }

    /// Cancel a whole job, or only the runs on `nodes`.
    ///
    /// Local state changes first. The affected nodes are then told to stop
    /// with a signed cancel query in the background; whether they do is not
    /// tracked.
    pub async fn cancel(&self, job_id: Uuid, nodes: Option<&[String]>) -> Result<CancelOutcome> {
        let record = self.record(job_id).await?;

        let cells: Vec<(String, Arc<RunCell>)> = match nodes {
            Some(nodes) => nodes
                .iter()
                .map(|node| {
                    record
                        .runs
                        .get(node)
                        .map(|cell| (node.clone(), cell.clone()))
                        .ok_or_else(|| ShoveyError::RunNotFound {
                            job_id,
                            node: node.clone(),
                        })
                })
                .collect::<Result<_>>()?,
            None => {
                if !record.cancelled.swap(true, Ordering::SeqCst) {
                    if let Some(store) = &self.store {
                        if let Err(e) = store.save_job(&record.job()).await {
                            tracing::error!(job_id = %job_id, error = %e, "Failed to save job");
                        }
                    }
                }
                record
                    .runs
                    .iter()
                    .map(|(node, cell)| (node.clone(), cell.clone()))
                    .collect()
            }
        };

        let now = Utc::now();
        let mut outcome = CancelOutcome::default();
        for (node, cell) in cells {
            if cell.update(&self.store, |run| run.cancel(now)).await {
                outcome.cancelled.push(node);
            } else {
                outcome.already_terminal.push(node);
            }
        }

        tracing::info!(
            job_id = %job_id,
            cancelled = outcome.cancelled.len(),
            already_terminal = outcome.already_terminal.len(),
            "Cancelled runs"
        );

        if !outcome.cancelled.is_empty() {
            self.notify_cancel(&record.job, outcome.cancelled.clone(), now)
                .await;
        }
        Ok(outcome)
    }

    async fn notify_cancel(&self, job: &Job, nodes: Vec<String>, now: DateTime<Utc>) {
        let expires_at = now
            .checked_add_signed(to_chrono(job.run_timeout()))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let payload = CommandPayload {
            command: NodeCommand::Cancel { job_id: job.id },
            issued_at: now,
            expires_at,
        };
        let envelope = match seal(self.signer.as_ref(), &payload, expires_at)
            .and_then(|envelope| envelope.to_bytes())
        {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "Could not sign cancel request, nodes not notified");
                return;
            }
        };

        let bus = self.bus.clone();
        let job_id = job.id;
        tokio::spawn(async move {
            match bus.query(topics::CANCEL, envelope, &nodes).await {
                Ok(mut acks) => {
                    while let Some(QueryResponse { node, ack }) = acks.recv().await {
                        tracing::debug!(job_id = %job_id, node = %node, ack = ?ack, "Cancel delivered");
                    }
                }
                Err(e) => {
                    tracing::warn!(job_id = %job_id, error = %e, "Cancel query failed");
                }
            }
        });
    }

    /// Time out every unfinished run whose job deadline has passed. Returns
    /// the number of runs timed out.
    pub async fn expire_overdue(&self, now: DateTime<Utc>) -> usize {
        let records: Vec<Arc<JobRecord>> = self.jobs.read().await.values().cloned().collect();
        let mut expired = 0;
        for record in records {
            if now < record.job.deadline() || record.is_settled().await {
                continue;
            }
            for (node, cell) in &record.runs {
                if cell.update(&self.store, |run| run.time_out(now)).await {
                    tracing::info!(job_id = %record.job.id, node = %node, "Run timed out");
                    expired += 1;
                }
            }
        }
        expired
    }

    pub async fn job_count(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn get_job(&self, job_id: Uuid) -> Result<JobView> {
        let record = self.record(job_id).await?;
        let mut nodes = Vec::with_capacity(record.runs.len());
        for cell in record.runs.values() {
            nodes.push(RunSummary::from(&*cell.run.lock().await));
        }
        let (status, breakdown) = aggregate(record.job.quorum_failed, nodes.iter().map(|n| n.state));
        Ok(JobView {
            job: record.job(),
            status,
            breakdown,
            nodes,
        })
    }

    /// Jobs ordered by submission time, oldest first.
    pub async fn list_jobs(&self, filter: &JobFilter) -> JobPage {
        let mut records: Vec<Arc<JobRecord>> = self.jobs.read().await.values().cloned().collect();
        records.sort_by(|a, b| {
            a.job
                .submitted_at
                .cmp(&b.job.submitted_at)
                .then_with(|| a.job.id.cmp(&b.job.id))
        });

        let mut matching = Vec::new();
        for record in records {
            let (status, breakdown) = record.status().await;
            if filter.status.is_some_and(|wanted| wanted != status) {
                continue;
            }
            matching.push(JobSummary {
                id: record.job.id,
                command: record.job.command.clone(),
                submitted_at: record.job.submitted_at,
                target_count: record.job.targets.len(),
                status,
                breakdown,
            });
        }

        let total = matching.len();
        let limit = filter.limit.unwrap_or(usize::MAX);
        let jobs: Vec<JobSummary> = matching.into_iter().skip(filter.offset).take(limit).collect();
        let has_more = filter.offset.saturating_add(jobs.len()) < total;
        JobPage {
            jobs,
            total,
            has_more,
        }
    }

    pub async fn run_detail(&self, job_id: Uuid, node: &str) -> Result<RunDetail> {
        let run = self.cell(job_id, node).await?.snapshot().await;
        Ok(RunDetail {
            stdout: run.output(OutputStream::Stdout),
            stderr: run.output(OutputStream::Stderr),
            run,
        })
    }

    /// Output chunks after `after`, waiting up to `wait` for new ones while
    /// the run is still going.
    pub async fn stream_output(
        &self,
        job_id: Uuid,
        node: &str,
        after: Option<u64>,
        wait: Duration,
    ) -> Result<OutputBatch> {
        let cell = self.cell(job_id, node).await?;
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            let notified = cell.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let run = cell.run.lock().await;
                let chunks = run.chunks_after(after);
                let is_last = run.is_terminal();
                if !chunks.is_empty() || is_last || tokio::time::Instant::now() >= deadline {
                    return Ok(OutputBatch {
                        chunks,
                        last_sequence: run.last_sequence(),
                        is_last,
                    });
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let run = cell.run.lock().await;
                return Ok(OutputBatch {
                    chunks: run.chunks_after(after),
                    last_sequence: run.last_sequence(),
                    is_last: run.is_terminal(),
                });
            }
        }
    }
}

/// Apply the per-node answers to a job query. Runs that never got an
/// answer by the time the stream closes are nacked.
async fn collect_acks(
    record: Arc<JobRecord>,
    mut acks: mpsc::Receiver<QueryResponse>,
    store: SharedStore,
) {
    let job_id = record.job.id;
    while let Some(QueryResponse { node, ack }) = acks.recv().await {
        let Some(cell) = record.runs.get(&node) else {
            tracing::warn!(job_id = %job_id, node = %node, "Acknowledgement from a node that was not targeted");
            continue;
        };
        let now = Utc::now();
        match ack {
            QueryAck::Ack => {
                if cell.update(&store, |run| run.acknowledge(now)).await {
                    tracing::debug!(job_id = %job_id, node = %node, "Node accepted job");
                }
            }
            QueryAck::Nack(reason) => {
                tracing::warn!(job_id = %job_id, node = %node, reason = %reason, "Node did not accept job");
                cell.update(&store, |run| run.reject(reason, now)).await;
            }
        }
    }

    let now = Utc::now();
    for (node, cell) in &record.runs {
        if cell
            .update(&store, |run| run.reject("no acknowledgement", now))
            .await
        {
            tracing::warn!(job_id = %job_id, node = %node, "No acknowledgement from node");
        }
    }
}

/// Periodically time out overdue runs until `shutdown` is cancelled.
pub async fn run_timeout_checker(dispatcher: Arc<Dispatcher>, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(dispatcher.config.timeout_check_interval);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::debug!("Timeout checker stopping");
                break;
            }
            _ = interval.tick() => {
                let expired = dispatcher.expire_overdue(Utc::now()).await;
                if expired > 0 {
                    tracing::debug!(count = expired, "Timed out overdue runs");
                }
            }
        }
    }
}
