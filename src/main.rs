use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use areaflow::clock::{system_clock, SharedClock};
use areaflow::config::EngineConfig;
use areaflow::pipeline::{ExecutionService, StorePipeline};
use areaflow::queue::memory::MemoryQueue;
use areaflow::queue::JobQueue;
use areaflow::reaction::http::HttpReactionHandler;
use areaflow::reaction::CompositeReactionExecutor;
use areaflow::scheduler::http_poll::HttpPollingHandler;
use areaflow::scheduler::polling::{PollingHandler, PollingRunner};
use areaflow::scheduler::timer::TimerScheduler;
use areaflow::server::{build_router, AppState};
use areaflow::store::memory::MemoryStore;
use areaflow::worker::Worker;

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "areaflow=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = EngineConfig::from_env();
    let clock: SharedClock = system_clock();
    let cancel = CancellationToken::new();

    let store = Arc::new(MemoryStore::new());
    let queue = MemoryQueue::new();
    let shared_queue: Arc<dyn JobQueue> = Arc::new(queue.clone());

    let http_client = match reqwest::Client::builder()
        .timeout(config.http_timeout)
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            tracing::error!(error = %e, "failed to build HTTP client");
            return;
        }
    };

    let pipeline = Arc::new(StorePipeline::new(
        store.clone(),
        shared_queue.clone(),
        clock.clone(),
    ));
    let executor = Arc::new(ExecutionService::new(store.clone(), pipeline));

    // Ingestion: timers, declarative HTTP polling, webhooks.
    let timer = TimerScheduler::new(
        store.clone(),
        executor.clone(),
        clock.clone(),
        config.timer_tick,
        config.timer_batch,
    );
    let http_poller: Arc<dyn PollingHandler> = Arc::new(HttpPollingHandler::new(
        http_client.clone(),
        store.clone(),
        Vec::new(),
    ));
    let polling = PollingRunner::new(
        store.clone(),
        executor.clone(),
        vec![http_poller],
        clock.clone(),
        config.polling_tick,
        config.polling_batch,
    );

    // Delivery: the generic HTTP handler is the fallback for every
    // component that describes its delivery declaratively.
    let reactions = Arc::new(CompositeReactionExecutor::new(
        Vec::new(),
        Some(Arc::new(HttpReactionHandler::new(
            http_client,
            clock.clone(),
        ))),
    ));

    let mut tasks = tokio::task::JoinSet::new();
    {
        let cancel = cancel.clone();
        tasks.spawn(async move { timer.run(cancel).await });
    }
    {
        let cancel = cancel.clone();
        tasks.spawn(async move { polling.run(cancel).await });
    }
    for i in 0..config.workers {
        let worker = Worker::new(
            shared_queue.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            reactions.clone(),
            clock.clone(),
            format!("worker-{i}"),
            config.reserve_timeout,
            config.worker_backoff,
        );
        let cancel = cancel.clone();
        tasks.spawn(async move { worker.run(cancel).await });
    }
    {
        // Reservations abandoned by a crashed worker go back to pending.
        let queue = queue.clone();
        let cancel = cancel.clone();
        let interval = config.sweep_interval;
        let stuck_after = config.stuck_after;
        tasks.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let moved = queue.requeue_stuck(stuck_after);
                        if moved > 0 {
                            tracing::warn!(moved, "returned stuck reservations to pending");
                        }
                    }
                }
            }
        });
    }

    let app = build_router(AppState::new(store.clone(), executor, clock));

    tracing::info!("listening on {}", config.bind);
    let listener = match tokio::net::TcpListener::bind(config.bind).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(error = %e, addr = %config.bind, "failed to bind");
            cancel.cancel();
            return;
        }
    };

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutting down");
            }
            cancel.cancel();
        });
    }

    let shutdown = cancel.clone();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        shutdown.cancelled().await;
    });
    if let Err(e) = server.await {
        tracing::error!(error = %e, "server error");
    }

    cancel.cancel();
    while tasks.join_next().await.is_some() {}
    tracing::info!("engine stopped");
}
