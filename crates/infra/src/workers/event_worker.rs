//! Job event consumer.
//!
//! Feeds the [`JobEvent`]s published on a bus to a callback on a dedicated
//! thread. Notifications arrive after the job change has committed and may be
//! dropped, so a consumer observes the lifecycle and never drives it.
//! Events already buffered when shutdown is requested are still delivered.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use jobforge_core::{ProcessInstanceId, TenantId};
use jobforge_events::{EventBus, JobEvent, Subscription};

const POLL: Duration = Duration::from_millis(250);

/// Which job events a consumer wants. The default accepts everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobEventFilter {
    tenant_id: Option<TenantId>,
    process_instance_id: Option<ProcessInstanceId>,
    kinds: Vec<&'static str>,
}

impl JobEventFilter {
    pub fn all() -> Self {
        Self::default()
    }

    /// Only events of `tenant_id`; untenanted events are skipped.
    pub fn for_tenant(mut self, tenant_id: TenantId) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    pub fn for_process_instance(mut self, id: ProcessInstanceId) -> Self {
        self.process_instance_id = Some(id);
        self
    }

    /// Only events whose [`JobEventKind::name`](jobforge_events::JobEventKind::name)
    /// is one of `kinds`.
    pub fn with_kinds(mut self, kinds: &[&'static str]) -> Self {
        self.kinds.extend_from_slice(kinds);
        self
    }

    pub fn matches(&self, event: &JobEvent) -> bool {
        if self.tenant_id.is_some() && event.tenant_id != self.tenant_id {
            return false;
        }
        if self.process_instance_id.is_some()
            && event.process_instance_id != self.process_instance_id
        {
            return false;
        }
        self.kinds.is_empty() || self.kinds.contains(&event.kind.name())
    }
}

/// Counters reported when a consumer stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventWorkerStats {
    pub delivered: u64,
    pub filtered: u64,
    pub failed: u64,
}

/// Handle to stop a running consumer.
#[derive(Debug)]
pub struct EventWorkerHandle {
    stop: Arc<AtomicBool>,
    join: Option<thread::JoinHandle<EventWorkerStats>>,
}

impl EventWorkerHandle {
    /// Stop the consumer once the buffered events are delivered, and return
    /// its counters.
    pub fn shutdown(mut self) -> EventWorkerStats {
        self.stop.store(true, Ordering::Release);
        self.join
            .take()
            .and_then(|join| join.join().ok())
            .unwrap_or_default()
    }
}

#[derive(Debug)]
pub struct EventWorker;

impl EventWorker {
    /// Subscribe to `bus` and run `handler` for each event `filter` accepts.
    ///
    /// Handler errors are logged and counted; they never stop the consumer.
    pub fn spawn<B, H, E>(
        name: &str,
        bus: &B,
        filter: JobEventFilter,
        handler: H,
    ) -> std::io::Result<EventWorkerHandle>
    where
        B: EventBus<JobEvent> + ?Sized,
        H: FnMut(&JobEvent) -> Result<(), E> + Send + 'static,
        E: fmt::Display,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let consumer = Consumer {
            name: name.to_string(),
            subscription: bus.subscribe(),
            filter,
            stop: stop.clone(),
            handler,
            stats: EventWorkerStats::default(),
        };
        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || consumer.run())?;

        Ok(EventWorkerHandle {
            stop,
            join: Some(join),
        })
    }
}

struct Consumer<H> {
    name: String,
    subscription: Subscription<JobEvent>,
    filter: JobEventFilter,
    stop: Arc<AtomicBool>,
    handler: H,
    stats: EventWorkerStats,
}

impl<H, E> Consumer<H>
where
    H: FnMut(&JobEvent) -> Result<(), E>,
    E: fmt::Display,
{
    fn run(mut self) -> EventWorkerStats {
        while !self.stop.load(Ordering::Acquire) {
            match self.subscription.recv_timeout(POLL) {
                Ok(event) => self.deliver(&event),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    debug!(worker = %self.name, "job event bus closed");
                    break;
                }
            }
        }
        for event in self.subscription.drain() {
            self.deliver(&event);
        }

        info!(
            worker = %self.name,
            delivered = self.stats.delivered,
            filtered = self.stats.filtered,
            failed = self.stats.failed,
            "job event consumer stopped"
        );
        self.stats
    }

    fn deliver(&mut self, event: &JobEvent) {
        if !self.filter.matches(event) {
            self.stats.filtered += 1;
            return;
        }
        match (self.handler)(event) {
            Ok(()) => self.stats.delivered += 1,
            Err(err) => {
                self.stats.failed += 1;
                warn!(
                    worker = %self.name,
                    job_id = %event.job_id,
                    event = event.kind.name(),
                    error = %err,
                    "job event consumer failed"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use jobforge_core::JobId;
    use jobforge_events::{InMemoryEventBus, JobEventKind};
    use std::sync::Mutex;

    fn event(kind: JobEventKind) -> JobEvent {
        JobEvent::new(JobId::new(), kind, Utc::now())
    }

    #[test]
    fn filter_selects_tenant_instance_and_kind() {
        let tenant = TenantId::new();
        let instance = ProcessInstanceId::new();
        let filter = JobEventFilter::all()
            .for_tenant(tenant)
            .for_process_instance(instance)
            .with_kinds(&["job.dead_lettered"]);

        let ours = event(JobEventKind::DeadLettered)
            .with_tenant(Some(tenant))
            .with_process_instance(Some(instance));
        assert!(filter.matches(&ours));
        assert!(!filter.matches(&event(JobEventKind::DeadLettered)));
        assert!(!filter.matches(
            &event(JobEventKind::Deleted)
                .with_tenant(Some(tenant))
                .with_process_instance(Some(instance))
        ));
        assert!(!filter.matches(
            &event(JobEventKind::DeadLettered)
                .with_tenant(Some(TenantId::new()))
                .with_process_instance(Some(instance))
        ));
        assert!(JobEventFilter::all().matches(&event(JobEventKind::Suspended)));
    }

    #[test]
    fn buffered_events_are_delivered_before_shutdown_returns() {
        let bus = InMemoryEventBus::<JobEvent>::new();
        let tenant = TenantId::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        let handle = EventWorker::spawn(
            "job-events",
            &bus,
            JobEventFilter::all().for_tenant(tenant),
            move |event: &JobEvent| {
                if matches!(event.kind, JobEventKind::Deleted) {
                    return Err("deleted jobs are not tracked");
                }
                sink.lock().unwrap().push(event.job_id);
                Ok(())
            },
        )
        .unwrap();

        let ours = event(JobEventKind::Suspended).with_tenant(Some(tenant));
        let ours_id = ours.job_id;
        bus.publish(event(JobEventKind::Suspended)).unwrap();
        bus.publish(event(JobEventKind::Suspended).with_tenant(Some(TenantId::new())))
            .unwrap();
        bus.publish(event(JobEventKind::Deleted).with_tenant(Some(tenant)))
            .unwrap();
        bus.publish(ours).unwrap();

        let stats = handle.shutdown();
        assert_eq!(*seen.lock().unwrap(), vec![ours_id]);
        assert_eq!(
            stats,
            EventWorkerStats {
                delivered: 1,
                filtered: 2,
                failed: 1,
            }
        );
    }
}
