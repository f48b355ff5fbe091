//! Running many independent pipelines in one process.
//!
//! Each [`Pipeline`] runs as its own task with a jittered start. All of them
//! share one shutdown token, an optional concurrency limit and an optional
//! storage pool through [`PipelineContext`].

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use snafu::ResultExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::StoragePool;
use crate::config::{GlobalConfig, MetricsConfig};
use crate::error::{AddressParseSnafu, MetricsSnafu, PipelineSetupError};
use crate::resource::StoragePoolRef;
use crate::signal::spawn_shutdown_handler;

/// Shared resources for pipeline execution.
#[derive(Clone)]
pub struct PipelineContext {
    /// Limits how many pipelines do work at the same moment.
    pub global_semaphore: Option<Arc<Semaphore>>,
    /// Shared storage clients, when connection pooling is enabled.
    pub storage_pool: Option<StoragePoolRef>,
    /// Maximum start jitter in seconds.
    pub poll_jitter_secs: u64,
    /// Cancellation token for graceful shutdown.
    pub shutdown: CancellationToken,
}

impl PipelineContext {
    /// Create a new pipeline context.
    pub fn new(
        total_concurrency: Option<usize>,
        connection_pooling: bool,
        poll_jitter_secs: u64,
        shutdown: CancellationToken,
    ) -> Self {
        let global_semaphore = total_concurrency.map(|n| Arc::new(Semaphore::new(n.max(1))));
        let storage_pool = connection_pooling.then(|| Arc::new(StoragePool::new()));

        Self {
            global_semaphore,
            storage_pool,
            poll_jitter_secs,
            shutdown,
        }
    }

    /// Context built from the global section of a config file.
    pub fn from_global(global: &GlobalConfig, shutdown: CancellationToken) -> Self {
        Self::new(
            global.total_concurrency,
            global.connection_pooling,
            global.poll_jitter_secs,
            shutdown,
        )
    }
}

/// A self-contained pipeline unit that can be executed.
pub trait Pipeline: Send + 'static {
    /// The key type used to identify this pipeline.
    type Key: Clone + Display + Send + 'static;

    /// The error type returned by this pipeline.
    type Error: std::error::Error + Send + 'static;

    /// Get a reference to the pipeline's key.
    fn key(&self) -> &Self::Key;

    /// Run this pipeline until it finishes or shutdown is requested.
    fn run(self) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

/// Orchestrates multiple pipeline executions with shared shutdown handling.
pub struct PipelineRunner<P: Pipeline> {
    pipelines: Vec<P>,
    shutdown: CancellationToken,
    poll_jitter_secs: u64,
    typetag: &'static str,
}

/// Per-pipeline outcome collected by [`PipelineRunner::run`].
pub type PipelineResults<P> = Vec<(<P as Pipeline>::Key, Result<(), <P as Pipeline>::Error>)>;

impl<P: Pipeline> PipelineRunner<P> {
    /// Create a new pipeline runner.
    pub fn new(
        pipelines: Vec<P>,
        shutdown: CancellationToken,
        poll_jitter_secs: u64,
        typetag: &'static str,
    ) -> Self {
        Self {
            pipelines,
            shutdown,
            poll_jitter_secs,
            typetag,
        }
    }

    /// Cancel the runner's token on SIGINT, SIGTERM or SIGQUIT.
    pub fn spawn_shutdown_handler(&self) {
        spawn_shutdown_handler(self.shutdown.clone());
    }

    /// Run all pipelines to completion and return how each one ended.
    pub async fn run(self) -> PipelineResults<P> {
        let mut handles: JoinSet<(P::Key, Result<(), P::Error>)> = JoinSet::new();
        let typetag = self.typetag;

        for pipeline in self.pipelines {
            let shutdown = self.shutdown.clone();
            let key = pipeline.key().clone();
            let start_jitter = random_jitter(self.poll_jitter_secs);

            handles.spawn(async move {
                if !start_jitter.is_zero() {
                    info!(
                        target = %key,
                        jitter_ms = start_jitter.as_millis() as u64,
                        "Delaying {} start for jitter", typetag
                    );
                    if shutdown
                        .run_until_cancelled(tokio::time::sleep(start_jitter))
                        .await
                        .is_none()
                    {
                        info!(target = %key, "Shutdown requested during jitter delay");
                        return (key, Ok(()));
                    }
                }

                let result = pipeline.run().await;
                (key, result)
            });
        }

        info!("Spawned {} {} tasks", handles.len(), typetag);

        let mut results = Vec::with_capacity(handles.len());
        while let Some(joined) = handles.join_next().await {
            match joined {
                Ok((key, Ok(()))) => {
                    info!(target = %key, "{} completed", typetag);
                    results.push((key, Ok(())));
                }
                Ok((key, Err(e))) => {
                    error!(target = %key, error = %e, "{} failed", typetag);
                    results.push((key, Err(e)));
                }
                Err(e) => {
                    error!(error = %e, "{} task panicked", typetag);
                }
            }
        }

        info!("All {}s complete", typetag);
        results
    }
}

/// Start metrics, wire signals to a shutdown token, build pipelines from the
/// shared context and run them until they all finish.
pub async fn run_pipelines<P, F>(
    metrics: &MetricsConfig,
    global: &GlobalConfig,
    typetag: &'static str,
    create_pipelines: F,
) -> Result<PipelineResults<P>, PipelineSetupError>
where
    P: Pipeline,
    F: FnOnce(PipelineContext) -> Vec<P>,
{
    if metrics.enabled {
        let addr = metrics.address.parse().context(AddressParseSnafu)?;
        crate::init_metrics(addr).context(MetricsSnafu)?;
    }

    let shutdown = CancellationToken::new();
    let context = PipelineContext::from_global(global, shutdown.clone());
    let pipelines = create_pipelines(context);

    let runner = PipelineRunner::new(pipelines, shutdown, global.poll_jitter_secs, typetag);
    runner.spawn_shutdown_handler();
    Ok(runner.run().await)
}

/// Generate a random jitter duration up to the specified maximum seconds.
pub fn random_jitter(max_secs: u64) -> Duration {
    if max_secs > 0 {
        Duration::from_millis(rand::rng().random_range(0..max_secs * 1000))
    } else {
        Duration::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snafu::Snafu;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Snafu)]
    #[snafu(display("pipeline {key} broke"))]
    struct Broke {
        key: String,
    }

    struct CountingPipeline {
        key: String,
        fail: bool,
        runs: Arc<AtomicUsize>,
    }

    impl Pipeline for CountingPipeline {
        type Key = String;
        type Error = Broke;

        fn key(&self) -> &String {
            &self.key
        }

        async fn run(self) -> Result<(), Broke> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return BrokeSnafu { key: self.key }.fail();
            }
            Ok(())
        }
    }

    #[test]
    fn test_random_jitter_zero() {
        assert_eq!(random_jitter(0), Duration::ZERO);
    }

    #[test]
    fn test_random_jitter_within_bounds() {
        for _ in 0..100 {
            assert!(random_jitter(3) < Duration::from_secs(3));
        }
    }

    #[test]
    fn test_context_from_global() {
        let global = GlobalConfig {
            total_concurrency: Some(2),
            connection_pooling: true,
            poll_jitter_secs: 4,
        };
        let ctx = PipelineContext::from_global(&global, CancellationToken::new());
        let clone = ctx.clone();

        assert_eq!(ctx.poll_jitter_secs, 4);
        assert!(Arc::ptr_eq(
            ctx.global_semaphore.as_ref().unwrap(),
            clone.global_semaphore.as_ref().unwrap()
        ));
        assert!(Arc::ptr_eq(
            ctx.storage_pool.as_ref().unwrap(),
            clone.storage_pool.as_ref().unwrap()
        ));
    }

    #[tokio::test]
    async fn test_runner_collects_results() {
        let runs = Arc::new(AtomicUsize::new(0));
        let pipelines = vec![
            CountingPipeline {
                key: "ok".to_string(),
                fail: false,
                runs: runs.clone(),
            },
            CountingPipeline {
                key: "bad".to_string(),
                fail: true,
                runs: runs.clone(),
            },
        ];

        let runner = PipelineRunner::new(pipelines, CancellationToken::new(), 0, "pipeline");
        let mut results = runner.run().await;
        results.sort_by(|a, b| a.0.cmp(&b.0));

        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, "bad");
        assert!(results[0].1.is_err());
        assert!(results[1].1.is_ok());
    }
}
