//! rollwatch dispatcher: waits for the event source to sync, then routes
//! every change event to its handler.
//!
//! Events are spread over worker queues by identity hash, so one identity is
//! always handled by one worker in delivery order while different identities
//! proceed concurrently. A failing or panicking handler only loses its own
//! event.

#![forbid(unsafe_code)]

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use rollwatch_core::{
    ChangeEvent, FnvShardPlanner, HandlerError, ResourceIdentity, ShardPlanner, SharedSnapshot, SinkError, StartupError,
    TransportError, WatchConfig,
};
use rollwatch_kubehub::{EventSource, SourceStreams};
use rollwatch_store::LocalCache;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub mod sink;

pub use sink::{
    render_human, render_json, ChannelSink, FanoutSink, Sink, SinkNotice, TracingSink, WriterHandle, WriterSink,
};

/// The three handler bindings registered once the cache is synced.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn on_add(&self, identity: &ResourceIdentity, snapshot: &SharedSnapshot) -> Result<(), HandlerError>;

    async fn on_update(
        &self,
        identity: &ResourceIdentity,
        old: &SharedSnapshot,
        new: &SharedSnapshot,
    ) -> Result<(), HandlerError>;

    async fn on_delete(&self, identity: &ResourceIdentity, last: Option<&SharedSnapshot>) -> Result<(), HandlerError>;
}

async fn invoke(handler: &dyn EventHandler, ev: &ChangeEvent) -> Result<(), HandlerError> {
    match ev {
        ChangeEvent::Added { identity, snapshot, .. } => handler.on_add(identity, snapshot).await,
        ChangeEvent::Updated { identity, old, new, .. } => handler.on_update(identity, old, new).await,
        ChangeEvent::Deleted { identity, last, .. } => handler.on_delete(identity, last.as_ref()).await,
    }
}

fn log_sink_failure(identity: &ResourceIdentity, res: Result<(), SinkError>) {
    if let Err(e) = res {
        metrics::counter!("sink_errors_total", 1u64);
        warn!(identity = %identity, error = %e, "sink failed; notice dropped");
    }
}

/// ADD → creation notice, UPDATE → change detection, DELETE → deletion notice.
///
/// Resource-level fields are read from the snapshots themselves, so only
/// sub-entity fields need to be named here.
pub struct SinkHandler {
    sink: Arc<dyn Sink>,
    tracked_fields: Vec<String>,
}

impl SinkHandler {
    pub fn new(sink: Arc<dyn Sink>, tracked_fields: Vec<String>) -> Self {
        Self { sink, tracked_fields }
    }
}

#[async_trait]
impl EventHandler for SinkHandler {
    async fn on_add(&self, identity: &ResourceIdentity, snapshot: &SharedSnapshot) -> Result<(), HandlerError> {
        log_sink_failure(identity, self.sink.on_create(identity, snapshot));
        Ok(())
    }

    async fn on_update(
        &self,
        identity: &ResourceIdentity,
        old: &SharedSnapshot,
        new: &SharedSnapshot,
    ) -> Result<(), HandlerError> {
        let detection = rollwatch_detect::detect(identity, old, new, &self.tracked_fields);
        if !detection.records.is_empty() {
            log_sink_failure(identity, self.sink.on_changes(identity, &detection.records));
        }
        if !detection.resource.is_empty() {
            log_sink_failure(identity, self.sink.on_resource_changes(identity, &detection.resource));
        }
        if !detection.structural.is_empty() {
            log_sink_failure(identity, self.sink.on_structure(identity, &detection.structural));
        }
        match detection.malformed.into_iter().next() {
            Some((side, err)) => {
                debug!(identity = %identity, ?side, "update carried unreadable sub-entities");
                Err(HandlerError::Malformed(err))
            }
            None => Ok(()),
        }
    }

    async fn on_delete(&self, identity: &ResourceIdentity, _last: Option<&SharedSnapshot>) -> Result<(), HandlerError> {
        log_sink_failure(identity, self.sink.on_delete(identity));
        Ok(())
    }
}

/// Counters for one dispatch session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub processed: u64,
    pub failed: u64,
    pub transport_errors: u64,
    pub cached: usize,
}

#[derive(Debug, Default)]
struct Counters {
    processed: AtomicU64,
    failed: AtomicU64,
    transport_errors: AtomicU64,
}

pub struct Dispatcher {
    source: Arc<dyn EventSource>,
    handler: Arc<dyn EventHandler>,
    cache: Arc<LocalCache>,
    sync_timeout: Duration,
    workers: usize,
    queue_capacity: usize,
}

impl Dispatcher {
    pub fn new(
        source: Arc<dyn EventSource>,
        handler: Arc<dyn EventHandler>,
        cache: Arc<LocalCache>,
        cfg: &WatchConfig,
    ) -> Self {
        Self {
            source,
            handler,
            cache,
            sync_timeout: cfg.sync_timeout,
            workers: cfg.workers(),
            queue_capacity: cfg.queue_capacity(),
        }
    }

    /// Dispatcher wired to a [`SinkHandler`] over `sink`.
    pub fn with_sink(source: Arc<dyn EventSource>, sink: Arc<dyn Sink>, cache: Arc<LocalCache>, cfg: &WatchConfig) -> Self {
        let handler = Arc::new(SinkHandler::new(sink, cfg.tracked_fields().to_vec()));
        Self::new(source, handler, cache, cfg)
    }

    /// Run the startup protocol, then dispatch until `cancel` fires or the
    /// source closes its event stream.
    ///
    /// Startup failures are returned before any handler runs; everything
    /// after sync is logged and counted in the report instead.
    pub async fn run(&self, cancel: CancellationToken) -> Result<DispatchReport, StartupError> {
        let SourceStreams { mut events, mut synced, errors } = match self.source.start(cancel.clone()).await {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "event source failed to start");
                return Err(e);
            }
        };

        let started = Instant::now();
        if let Err(e) = wait_for_sync(&mut synced, self.sync_timeout, &cancel).await {
            error!(error = %e, "cache never synced; no handlers registered");
            self.source.stop();
            return Err(e);
        }
        info!(objects = self.cache.len(), waited_ms = started.elapsed().as_millis() as u64, "cache synced; handlers registered");

        let counters = Arc::new(Counters::default());
        let planner = FnvShardPlanner::new(self.workers);
        let (queues, workers): (Vec<_>, Vec<_>) = (0..planner.buckets())
            .map(|idx| {
                let (tx, rx) = mpsc::channel::<ChangeEvent>(self.queue_capacity);
                (tx, spawn_worker(idx, rx, self.handler.clone(), counters.clone()))
            })
            .unzip();

        let mut errors = Some(errors);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("shutdown requested; draining workers");
                    break;
                }
                maybe = events.recv() => {
                    let Some(ev) = maybe else {
                        info!("event stream closed; draining workers");
                        break;
                    };
                    let queue = &queues[planner.plan(ev.identity())];
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            debug!("queued event dropped during shutdown");
                            break;
                        }
                        res = queue.send(ev) => {
                            if res.is_err() {
                                error!("worker queue closed unexpectedly");
                                break;
                            }
                        }
                    }
                }
                fault = recv_fault(&mut errors) => match fault {
                    Some(e) => self.note_fault(&counters, &e),
                    None => errors = None,
                },
            }
        }

        self.source.stop();
        if let Some(rx) = errors.as_mut() {
            while let Ok(e) = rx.try_recv() {
                self.note_fault(&counters, &e);
            }
        }
        drop(queues);
        for w in workers {
            if let Err(e) = w.await {
                error!(error = %e, "worker task failed");
            }
        }

        let report = DispatchReport {
            processed: counters.processed.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            transport_errors: counters.transport_errors.load(Ordering::Relaxed),
            cached: self.cache.len(),
        };
        info!(?report, "dispatcher stopped");
        Ok(report)
    }

    fn note_fault(&self, counters: &Counters, e: &TransportError) {
        counters.transport_errors.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("dispatch_transport_errors_total", 1u64);
        warn!(error = %e, objects = self.cache.len(), "transport error; serving last known cache state");
    }
}

async fn recv_fault(errors: &mut Option<mpsc::Receiver<TransportError>>) -> Option<TransportError> {
    match errors {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Block until the synced flag is set, bounded by `timeout` and `cancel`.
pub async fn wait_for_sync(
    synced: &mut watch::Receiver<bool>,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<(), StartupError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(StartupError::Cancelled),
        res = tokio::time::timeout(timeout, synced.wait_for(|s| *s)) => match res {
            Err(_) => Err(StartupError::SyncTimeout(timeout)),
            Ok(Err(_)) => Err(StartupError::SourceClosed),
            Ok(Ok(_)) => Ok(()),
        },
    }
}

fn spawn_worker(
    idx: usize,
    mut rx: mpsc::Receiver<ChangeEvent>,
    handler: Arc<dyn EventHandler>,
    counters: Arc<Counters>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(ev) = rx.recv().await {
            let t0 = Instant::now();
            let outcome = AssertUnwindSafe(invoke(handler.as_ref(), &ev)).catch_unwind().await;
            metrics::histogram!("dispatch_handle_ms", t0.elapsed().as_secs_f64() * 1000.0);
            let failure = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e),
                Err(panic) => Some(HandlerError::Panicked(panic_message(panic.as_ref()))),
            };
            match failure {
                None => {
                    counters.processed.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("dispatch_events_total", 1u64, "kind" => ev.kind().to_string());
                }
                Some(e) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("dispatch_handler_errors_total", 1u64);
                    warn!(worker = idx, kind = %ev.kind(), identity = %ev.identity(), error = %e, "handler failed; event dropped");
                }
            }
        }
        debug!(worker = idx, "worker drained");
    })
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
