use anyhow::{Context, Result};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::browser::extract::{BrowserExtractor, Extractor, HtmlExtractor, RenderPredicate};
use crate::cli::config::Settings;
use crate::fetch::http::{HttpFetcher, PageFetcher};
use crate::pipeline::source::{connect_source, QueuedTask, TaskSource};
use crate::storage::pages::{connect_store, PageStore};
use crate::utils::metrics::{MetricsSnapshot, PipelineMetrics};

/// Pause before pulling again after the source reported an error
const SOURCE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Lifecycle of one pipeline instance. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Starting,
    Running,
    Draining,
    Stopped,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid pipeline transition from {from:?} to {to:?}")]
    InvalidTransition {
        from: PipelineState,
        to: PipelineState,
    },

    #[error("pipeline cannot run in state {0:?}")]
    NotRunning(PipelineState),

    #[error("shutdown requested during startup")]
    Interrupted,
}

impl PipelineError {
    /// Whether an error chain ends in an interrupted startup
    pub fn is_interrupted(error: &anyhow::Error) -> bool {
        matches!(error.downcast_ref::<PipelineError>(), Some(PipelineError::Interrupted))
    }
}

/// Requests a graceful shutdown. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

/// Observes shutdown requests cooperatively
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Stop admitting tasks and drain. Safe to call repeatedly.
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_requested(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownSignal {
    pub fn is_requested(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown has been requested
    pub async fn requested(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                // Every handle is gone; nobody can ask for shutdown any more
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Tuning for the coordinator
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Tasks allowed in fetch→extract→persist at once
    pub max_concurrent: usize,

    /// Longest wait for in-flight tasks after shutdown; `None` waits indefinitely
    pub drain_timeout: Option<Duration>,

    /// URLs that go through the extraction stage
    pub render: RenderPredicate,
}

impl PipelineOptions {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Ok(Self {
            max_concurrent: settings.max_concurrent_fetches.max(1),
            drain_timeout: settings.drain_timeout(),
            render: RenderPredicate::new(&settings.render_url_pattern)
                .context("Invalid render URL pattern")?,
        })
    }
}

/// The stage instances one pipeline run coordinates
pub struct Stages {
    pub source: Arc<dyn TaskSource>,
    pub fetcher: Arc<dyn PageFetcher>,
    pub extractor: Option<Arc<dyn Extractor>>,
    pub store: Arc<dyn PageStore>,
}

/// Builds the stages for one run
#[async_trait]
pub trait StageFactory: Send + Sync {
    async fn source(&self) -> Result<Arc<dyn TaskSource>>;
    async fn fetcher(&self) -> Result<Arc<dyn PageFetcher>>;
    async fn extractor(&self) -> Result<Option<Arc<dyn Extractor>>>;
    async fn store(&self) -> Result<Arc<dyn PageStore>>;
}

/// Stages backed by the real broker, HTTP client, browser and database
pub struct ConfiguredStages {
    settings: Settings,
}

impl ConfiguredStages {
    pub fn new(settings: &Settings) -> Self {
        Self {
            settings: settings.clone(),
        }
    }
}

#[async_trait]
impl StageFactory for ConfiguredStages {
    async fn source(&self) -> Result<Arc<dyn TaskSource>> {
        let settings = &self.settings;
        let source = connect_source(
            settings.broker_url.as_deref(),
            &settings.request_topic,
            &settings.parsed_topic,
            settings.require_broker,
        )
        .await
        .context("Failed to start task source")?;
        Ok(source)
    }

    async fn fetcher(&self) -> Result<Arc<dyn PageFetcher>> {
        let fetcher = HttpFetcher::new(self.settings.http_timeout(), &self.settings.user_agent)
            .context("Failed to build HTTP client")?;
        Ok(Arc::new(fetcher))
    }

    async fn extractor(&self) -> Result<Option<Arc<dyn Extractor>>> {
        let settings = &self.settings;

        if settings.enable_browser {
            let extractor = BrowserExtractor::connect(
                &settings.webdriver_url,
                settings.http_timeout(),
                &settings.question_selector,
                &settings.answer_selector,
            )
            .await
            .context("Failed to initialize browser extraction")?;
            return Ok(Some(Arc::new(extractor)));
        }

        let extractor = HtmlExtractor::new(&settings.question_selector, &settings.answer_selector)
            .context("Failed to initialize HTML extraction")?;
        Ok(Some(Arc::new(extractor)))
    }

    async fn store(&self) -> Result<Arc<dyn PageStore>> {
        let settings = &self.settings;
        let store = connect_store(
            settings.mongo_uri.as_deref(),
            &settings.mongo_db,
            &settings.mongo_collection,
        )
        .await
        .context("Failed to connect to document store")?;
        Ok(Arc::from(store))
    }
}

/// Stages that are already initialized hand out clones of themselves
#[async_trait]
impl StageFactory for Stages {
    async fn source(&self) -> Result<Arc<dyn TaskSource>> {
        Ok(self.source.clone())
    }

    async fn fetcher(&self) -> Result<Arc<dyn PageFetcher>> {
        Ok(self.fetcher.clone())
    }

    async fn extractor(&self) -> Result<Option<Arc<dyn Extractor>>> {
        Ok(self.extractor.clone())
    }

    async fn store(&self) -> Result<Arc<dyn PageStore>> {
        Ok(self.store.clone())
    }
}

/// Stages initialized so far, released if startup does not complete
#[derive(Default)]
struct PartialStages {
    source: Option<Arc<dyn TaskSource>>,
    fetcher: Option<Arc<dyn PageFetcher>>,
    extractor: Option<Arc<dyn Extractor>>,
    store: Option<Arc<dyn PageStore>>,
}

impl PartialStages {
    async fn close(&self) {
        if let Some(source) = &self.source {
            source.stop().await;
        }
        if let Some(fetcher) = &self.fetcher {
            fetcher.close().await;
        }
        if let Some(store) = &self.store {
            store.close().await;
        }
        if let Some(extractor) = &self.extractor {
            extractor.close().await;
        }
    }
}

/// Run one startup step unless shutdown is requested first
async fn interruptible<T, F>(shutdown: &mut ShutdownSignal, step: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    if shutdown.is_requested() {
        return Err(PipelineError::Interrupted.into());
    }

    tokio::select! {
        biased;
        _ = shutdown.requested() => Err(PipelineError::Interrupted.into()),
        result = step => result,
    }
}

impl Stages {
    /// Initialize stages in dependency order: source, fetcher, extractor, store.
    ///
    /// If one fails, or shutdown is requested in between, the ones already
    /// initialized are released before the error is returned.
    pub async fn initialize(
        factory: &dyn StageFactory,
        shutdown: &mut ShutdownSignal,
    ) -> Result<Self> {
        let mut built = PartialStages::default();

        match Self::build(factory, shutdown, &mut built).await {
            Ok(stages) => Ok(stages),
            Err(e) => {
                built.close().await;
                Err(e)
            }
        }
    }

    async fn build(
        factory: &dyn StageFactory,
        shutdown: &mut ShutdownSignal,
        built: &mut PartialStages,
    ) -> Result<Self> {
        let source = interruptible(shutdown, factory.source()).await?;
        built.source = Some(source.clone());

        let fetcher = interruptible(shutdown, factory.fetcher()).await?;
        built.fetcher = Some(fetcher.clone());

        let extractor = interruptible(shutdown, factory.extractor()).await?;
        built.extractor = extractor.clone();

        let store = interruptible(shutdown, factory.store()).await?;
        built.store = Some(store.clone());

        Ok(Self {
            source,
            fetcher,
            extractor,
            store,
        })
    }

    /// Release stages: source, fetcher, store, then the slow browser session last
    pub async fn close(&self) {
        self.source.stop().await;
        self.fetcher.close().await;
        self.store.close().await;
        if let Some(extractor) = &self.extractor {
            extractor.close().await;
        }
        debug!("All pipeline stages closed");
    }
}

/// Everything a task needs, shared by all in-flight tasks
struct TaskContext {
    source: Arc<dyn TaskSource>,
    fetcher: Arc<dyn PageFetcher>,
    extractor: Option<Arc<dyn Extractor>>,
    store: Arc<dyn PageStore>,
    render: RenderPredicate,
    metrics: PipelineMetrics,
}

/// Consume→fetch→extract→persist coordinator
pub struct Pipeline {
    state: PipelineState,
    options: PipelineOptions,
    stages: Option<Stages>,
    metrics: PipelineMetrics,
    shutdown: ShutdownHandle,
}

impl Pipeline {
    pub fn new(options: PipelineOptions) -> Self {
        Self {
            state: PipelineState::Idle,
            options,
            stages: None,
            metrics: PipelineMetrics::new(),
            shutdown: ShutdownHandle::new(),
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Handle for requesting a graceful shutdown from elsewhere
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    fn transition(&mut self, to: PipelineState) -> Result<(), PipelineError> {
        use PipelineState::*;

        let allowed = matches!(
            (self.state, to),
            (Idle, Starting)
                | (Starting, Running)
                | (Starting, Stopped)
                | (Running, Draining)
                | (Draining, Stopped)
        );

        if !allowed {
            return Err(PipelineError::InvalidTransition {
                from: self.state,
                to,
            });
        }

        debug!(from = ?self.state, to = ?to, "Pipeline state changed");
        self.state = to;
        Ok(())
    }

    /// Initialize all stages from settings. A failure leaves the pipeline stopped.
    pub async fn start(&mut self, settings: &Settings) -> Result<()> {
        self.start_from(&ConfiguredStages::new(settings)).await
    }

    /// Initialize stages from a factory. A failure, or a shutdown request before
    /// every stage is up, releases what was built and leaves the pipeline stopped.
    pub async fn start_from(&mut self, factory: &dyn StageFactory) -> Result<()> {
        self.transition(PipelineState::Starting)?;
        let mut shutdown = self.shutdown.subscribe();

        match Stages::initialize(factory, &mut shutdown).await {
            Ok(stages) => {
                self.stages = Some(stages);
                self.transition(PipelineState::Running)?;
                Ok(())
            }
            Err(e) => {
                self.transition(PipelineState::Stopped)?;
                Err(e)
            }
        }
    }

    /// Consume tasks until shutdown is requested or the source is exhausted,
    /// then drain in-flight tasks and close every stage.
    pub async fn run(&mut self) -> Result<MetricsSnapshot> {
        if self.state != PipelineState::Running {
            return Err(PipelineError::NotRunning(self.state).into());
        }
        let Some(stages) = self.stages.take() else {
            return Err(PipelineError::NotRunning(self.state).into());
        };

        let ctx = Arc::new(TaskContext {
            source: stages.source.clone(),
            fetcher: stages.fetcher.clone(),
            extractor: stages.extractor.clone(),
            store: stages.store.clone(),
            render: self.options.render.clone(),
            metrics: self.metrics.clone(),
        });

        let semaphore = Arc::new(Semaphore::new(self.options.max_concurrent));
        let mut in_flight: JoinSet<()> = JoinSet::new();
        let mut shutdown = self.shutdown.subscribe();

        info!(
            max_concurrent = self.options.max_concurrent,
            degraded = stages.source.is_degraded(),
            persistence = stages.store.is_durable(),
            "Pipeline running"
        );

        loop {
            // Backpressure: no task is pulled until a slot is free
            let permit = tokio::select! {
                biased;
                _ = shutdown.requested() => break,
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    log_join_result(joined);
                    continue;
                }
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let next = tokio::select! {
                biased;
                _ = shutdown.requested() => break,
                next = stages.source.next_task() => next,
            };

            match next {
                Ok(Some(queued)) => {
                    self.metrics.record_admitted().await;
                    let ctx = ctx.clone();
                    in_flight.spawn(async move {
                        let _permit = permit;
                        process_task(ctx, queued).await;
                    });
                }
                Ok(None) => {
                    info!("Task source exhausted");
                    break;
                }
                Err(e) => {
                    drop(permit);
                    error!(error = %e, "Failed to receive task; retrying");
                    tokio::select! {
                        biased;
                        _ = shutdown.requested() => break,
                        _ = tokio::time::sleep(SOURCE_RETRY_DELAY) => {}
                    }
                }
            }
        }

        self.transition(PipelineState::Draining)?;
        info!(in_flight = in_flight.len(), "Draining in-flight tasks");
        self.drain(&mut in_flight).await;

        stages.close().await;
        self.transition(PipelineState::Stopped)?;

        let snapshot = self.metrics.snapshot().await;
        info!(
            admitted = snapshot.tasks_admitted,
            persisted = snapshot.persisted,
            persist_failures = snapshot.persist_failures,
            fetch_failures = snapshot.fetch_failures,
            abandoned = snapshot.abandoned,
            avg_latency_ms = snapshot.average_latency_ms(),
            "service_stopped"
        );

        Ok(snapshot)
    }

    async fn drain(&self, in_flight: &mut JoinSet<()>) {
        let Some(deadline) = self.options.drain_timeout else {
            join_all(in_flight).await;
            return;
        };

        if tokio::time::timeout(deadline, join_all(in_flight)).await.is_err() {
            let remaining = in_flight.len();
            warn!(
                remaining,
                deadline_secs = deadline.as_secs_f64(),
                "Drain deadline elapsed; aborting remaining tasks"
            );
            in_flight.abort_all();
            while in_flight.join_next().await.is_some() {}
            self.metrics.record_abandoned(remaining).await;
        }
    }
}

async fn join_all(in_flight: &mut JoinSet<()>) {
    while let Some(joined) = in_flight.join_next().await {
        log_join_result(joined);
    }
}

fn log_join_result(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!(error = %e, "Task panicked");
        }
    }
}

/// Run one task through fetch, optional extraction and persistence.
/// Every failure stays local to this task.
async fn process_task(ctx: Arc<TaskContext>, queued: QueuedTask) {
    let QueuedTask { task, receipt } = queued;

    let mut record = ctx.fetcher.fetch(&task).await;
    ctx.metrics
        .record_fetch(record.status_code, record.latency_ms, record.content_length)
        .await;

    if let Some(extractor) = &ctx.extractor {
        let wants_extraction = ctx.render.matches(&record.url)
            && (record.html.is_some() || extractor.renders_javascript());

        if wants_extraction {
            let extraction = extractor.extract(&record.url, record.html.as_deref()).await;
            ctx.metrics.record_extraction(!extraction.is_empty()).await;
            record.apply_extraction(extraction, extractor.kind());
        }
    }

    debug_assert!(record.is_consistent(), "inconsistent record for {}", record.url);

    match ctx.store.save(&record).await {
        Ok(()) => {
            ctx.metrics.record_persisted().await;

            if let Some(receipt) = &receipt {
                if let Err(e) = ctx.source.ack(receipt).await {
                    warn!(url = %record.url, error = %e, "Failed to acknowledge message");
                }
            }

            if let Some(parsed) = record.parsed_page() {
                if let Err(e) = ctx.source.publish_parsed(&parsed).await {
                    warn!(url = %record.url, error = %e, "Failed to publish parsed page");
                }
            }

            info!(
                url = %record.url,
                id = %record.id,
                success = record.is_success(),
                status_code = ?record.status_code,
                latency_ms = record.latency_ms,
                error = ?record.error,
                "task_processed"
            );
        }
        Err(e) => {
            ctx.metrics.record_persist_failure().await;
            error!(
                url = %record.url,
                id = %record.id,
                status_code = ?record.status_code,
                error = %e,
                recoverable = e.is_recoverable(),
                "persist_failed"
            );

            if let Some(receipt) = &receipt {
                if let Err(e) = ctx.source.dead_letter(receipt, &e.to_string()).await {
                    warn!(url = %record.url, error = %e, "Failed to dead-letter message");
                }
            }
        }
    }
}
