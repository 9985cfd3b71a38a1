//! The job engine facade: one context shared by every component.

use std::sync::Arc;

use jobforge_core::{Clock, HandlerError, JobId, JobResult};
use jobforge_events::{EventBus, JobEvent};

use crate::config::EngineConfig;

use super::acquisition::JobAcquirer;
use super::admin::JobAdmin;
use super::context::EngineContext;
use super::executor::{ExecutionOutcome, JobExecutor};
use super::external_worker::ExternalWorkerProtocol;
use super::handler::{HandlerRegistry, JobHandler, ProcessRuntime};
use super::retry::{RetryEngine, RetryOutcome};
use super::scheduler::JobScheduler;
use super::store::JobStore;
use super::types::{AcquiredJobBatch, NewJob};

/// Acquisition, dispatch, retry, scheduling, the external worker protocol and
/// administration over one store.
///
/// ```ignore
/// let engine = JobEngine::builder(InMemoryJobStore::arc())
///     .config(EngineConfig::from_env()?)
///     .handler("send-invoice", send_invoice)
///     .build();
/// let batch = engine.acquire(8)?;
/// ```
#[derive(Debug)]
pub struct JobEngine<S> {
    ctx: Arc<EngineContext<S>>,
    acquirer: JobAcquirer<S>,
    executor: JobExecutor<S>,
    retry: RetryEngine<S>,
    scheduler: JobScheduler<S>,
    external: ExternalWorkerProtocol<S>,
    admin: JobAdmin<S>,
}

impl<S: JobStore> JobEngine<S> {
    pub fn builder(store: S) -> JobEngineBuilder<S> {
        JobEngineBuilder::new(store)
    }

    pub fn acquire(&self, capacity: usize) -> JobResult<AcquiredJobBatch> {
        self.acquirer.acquire(capacity)
    }

    pub fn execute(&self, job_id: JobId) -> JobResult<ExecutionOutcome> {
        self.executor.execute(job_id)
    }

    pub fn retry(&self, job_id: JobId, error: &HandlerError) -> JobResult<RetryOutcome> {
        self.retry.retry(job_id, error)
    }

    pub fn schedule(&self, new_job: NewJob) -> JobResult<JobId> {
        self.scheduler.schedule(new_job)
    }

    pub fn scheduler(&self) -> &JobScheduler<S> {
        &self.scheduler
    }

    pub fn external_worker(&self) -> &ExternalWorkerProtocol<S> {
        &self.external
    }

    pub fn admin(&self) -> &JobAdmin<S> {
        &self.admin
    }

    pub fn config(&self) -> &EngineConfig {
        &self.ctx.config
    }

    pub fn context(&self) -> &Arc<EngineContext<S>> {
        &self.ctx
    }

    pub fn store(&self) -> &S {
        &self.ctx.store
    }
}

pub struct JobEngineBuilder<S> {
    store: S,
    config: EngineConfig,
    clock: Option<Arc<dyn Clock>>,
    events: Option<Arc<dyn EventBus<JobEvent>>>,
    registry: HandlerRegistry,
}

impl<S: JobStore> JobEngineBuilder<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            config: EngineConfig::default(),
            clock: None,
            events: None,
            registry: HandlerRegistry::new(),
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn event_bus(mut self, bus: Arc<dyn EventBus<JobEvent>>) -> Self {
        self.events = Some(bus);
        self
    }

    pub fn runtime(mut self, runtime: Arc<dyn ProcessRuntime>) -> Self {
        self.registry = self.registry.with_runtime(runtime);
        self
    }

    pub fn handler<H>(mut self, pattern: impl Into<String>, handler: H) -> Self
    where
        H: JobHandler + 'static,
    {
        self.registry.register(pattern, handler);
        self
    }

    pub fn build(self) -> JobEngine<S> {
        let mut ctx = EngineContext::new(self.store, self.config);
        if let Some(clock) = self.clock {
            ctx = ctx.with_clock(clock);
        }
        if let Some(bus) = self.events {
            ctx = ctx.with_event_bus(bus);
        }
        let ctx = Arc::new(ctx);

        JobEngine {
            acquirer: JobAcquirer::new(ctx.clone()),
            executor: JobExecutor::new(ctx.clone(), Arc::new(self.registry)),
            retry: RetryEngine::new(ctx.clone()),
            scheduler: JobScheduler::new(ctx.clone()),
            external: ExternalWorkerProtocol::new(ctx.clone()),
            admin: JobAdmin::new(ctx.clone()),
            ctx,
        }
    }
}
