//! Shared engine context threaded through every component.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::warn;

use jobforge_core::{Clock, JobError, JobResult, SystemClock};
use jobforge_events::{EventBus, JobEvent, JobEventKind};

use crate::config::{EngineConfig, add_duration};

use super::types::JobRecord;

/// Store, configuration, clock and notification sink for one engine.
///
/// Built once and shared (`Arc`) by acquisition, dispatch, retry, the external
/// worker protocol and the administrative operations.
pub struct EngineContext<S> {
    pub store: S,
    pub config: EngineConfig,
    pub clock: Arc<dyn Clock>,
    events: Option<Arc<dyn EventBus<JobEvent>>>,
}

impl<S> EngineContext<S> {
    pub fn new(store: S, config: EngineConfig) -> Self {
        Self {
            store,
            config,
            clock: Arc::new(SystemClock),
            events: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_event_bus(mut self, bus: Arc<dyn EventBus<JobEvent>>) -> Self {
        self.events = Some(bus);
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Expiry of a lease (job or instance lock) taken at `now`.
    pub fn lock_until(&self, now: DateTime<Utc>) -> JobResult<DateTime<Utc>> {
        add_duration(now, self.config.async_job_lock_time).ok_or_else(|| {
            JobError::configuration(format!(
                "async job lock time {:?} is out of range",
                self.config.async_job_lock_time
            ))
        })
    }

    /// Publish a notification about `record`. Called after the transaction
    /// commits; failures are logged and never affect the job.
    pub(crate) fn emit(&self, record: &JobRecord, kind: JobEventKind) {
        let Some(bus) = &self.events else {
            return;
        };
        let name = kind.name();
        let event = JobEvent::new(record.id, kind, self.now())
            .with_process_instance(record.process_instance_id())
            .with_tenant(record.tenant_id);
        if let Err(err) = bus.publish(event) {
            warn!(job_id = %record.id, event = name, error = %err, "failed to publish job event");
        }
    }
}

impl<S: fmt::Debug> fmt::Debug for EngineContext<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineContext")
            .field("store", &self.store)
            .field("config", &self.config)
            .field("clock", &self.clock)
            .field("events", &self.events.is_some())
            .finish()
    }
}
