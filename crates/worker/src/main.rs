//! Standalone job engine process: acquires and executes jobs until Ctrl-C.

use std::sync::Arc;

use sqlx::PgPool;
use tracing::{debug, info, warn};

use jobforge_core::HandlerError;
use jobforge_events::{InMemoryEventBus, JobEvent};
use jobforge_infra::EngineConfig;
use jobforge_infra::jobs::{
    Correlation, InMemoryJobStore, JobContext, JobEngine, JobStore, PostgresJobStore,
    ProcessRuntime,
};
use jobforge_infra::workers::{AsyncExecutor, EventWorker, JobEventFilter};

/// Runtime for deployments without a process interpreter: every job succeeds
/// after being logged.
#[derive(Debug)]
struct LoggingRuntime;

impl ProcessRuntime for LoggingRuntime {
    fn execute(
        &self,
        handler_type: &str,
        configuration: Option<&str>,
        correlation: &Correlation,
        ctx: &mut JobContext<'_>,
    ) -> Result<(), HandlerError> {
        info!(
            job_id = %ctx.job().id,
            handler_type,
            configuration,
            process_instance_id = ?correlation.process_instance_id(),
            "job executed"
        );
        Ok(())
    }

    fn continue_process_at(
        &self,
        correlation: &Correlation,
        ctx: &mut JobContext<'_>,
    ) -> Result<(), HandlerError> {
        info!(
            job_id = %ctx.job().id,
            execution_id = ?correlation.execution_id(),
            "external work completed"
        );
        Ok(())
    }

    fn raise_business_error(
        &self,
        correlation: &Correlation,
        error_code: Option<&str>,
        ctx: &mut JobContext<'_>,
    ) -> Result<(), HandlerError> {
        warn!(
            job_id = %ctx.job().id,
            execution_id = ?correlation.execution_id(),
            error_code,
            "business error reported"
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    jobforge_observability::init();

    let config = EngineConfig::from_env()?;

    match std::env::var("DATABASE_URL") {
        Ok(database_url) => {
            let pool = PgPool::connect(&database_url).await?;
            let store = PostgresJobStore::new(pool)?;
            store.migrate().await?;
            run(store, config).await
        }
        Err(_) => {
            warn!("DATABASE_URL not set; using the in-memory job store");
            run(InMemoryJobStore::arc(), config).await
        }
    }
}

async fn run<S>(store: S, config: EngineConfig) -> anyhow::Result<()>
where
    S: JobStore + 'static,
{
    let bus = Arc::new(InMemoryEventBus::<JobEvent>::new());
    let events = EventWorker::spawn(
        "jobforge-events",
        bus.as_ref(),
        JobEventFilter::all(),
        |event: &JobEvent| {
            debug!(job_id = %event.job_id, event = event.kind.name(), "job event");
            Ok::<(), std::convert::Infallible>(())
        },
    )?;

    let engine = Arc::new(
        JobEngine::builder(store)
            .config(config)
            .event_bus(bus)
            .runtime(Arc::new(LoggingRuntime))
            .build(),
    );
    let executor = AsyncExecutor::spawn(engine)?;

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");

    tokio::task::spawn_blocking(move || {
        executor.shutdown();
        events.shutdown();
    })
    .await?;
    info!("job engine stopped");
    Ok(())
}
