//! rollwatch kubehub: event sources feeding the local cache.
//!
//! An [`EventSource`] runs list-then-watch in the background, keeps the
//! shared [`LocalCache`](rollwatch_store::LocalCache) current, and hands the
//! dispatcher three channels: classified change events, a one-shot synced
//! flag, and transport faults.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rollwatch_core::{ChangeEvent, StartupError, TransportError};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

pub mod eventlog;
pub mod kube_source;
pub mod scripted;

pub use kube_source::{parse_gvk_key, KubeEventSource};
pub use scripted::{ScriptStep, ScriptedSource, SyncBehaviour};

/// Capacity of the transport error channel; faults past it are counted and dropped.
pub const ERROR_CHANNEL_CAP: usize = 64;

/// Channels handed to the dispatcher by [`EventSource::start`].
#[derive(Debug)]
pub struct SourceStreams {
    /// Classified events, in delivery order. Closed when the source stops.
    pub events: EventStream,
    /// Flips to `true` once, after the initial listing has been enqueued.
    /// The sender is dropped if the source dies before that.
    pub synced: watch::Receiver<bool>,
    pub errors: mpsc::Receiver<TransportError>,
}

/// Producer half of [`SourceStreams`], owned by the background task.
#[derive(Debug)]
pub(crate) struct SourceSenders {
    pub events: mpsc::UnboundedSender<ChangeEvent>,
    pub backlog: Arc<AtomicUsize>,
    pub synced: watch::Sender<bool>,
    pub errors: mpsc::Sender<TransportError>,
}

pub(crate) fn channels() -> (SourceSenders, SourceStreams) {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (synced_tx, synced_rx) = watch::channel(false);
    let (errors_tx, errors_rx) = mpsc::channel(ERROR_CHANNEL_CAP);
    let backlog = Arc::new(AtomicUsize::new(0));
    (
        SourceSenders { events: events_tx, backlog: backlog.clone(), synced: synced_tx, errors: errors_tx },
        SourceStreams { events: EventStream { rx: events_rx, backlog }, synced: synced_rx, errors: errors_rx },
    )
}

/// Receiving end of the event channel.
///
/// The channel is unbounded so the producer never stalls while the
/// dispatcher waits for sync; the number of undelivered events is exported
/// as the `source_backlog` gauge.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<ChangeEvent>,
    backlog: Arc<AtomicUsize>,
}

impl EventStream {
    /// Next event, or `None` once the source has stopped and the channel is drained.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        let ev = self.rx.recv().await?;
        let left = self.backlog.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
        metrics::gauge!("source_backlog", left as f64);
        Some(ev)
    }

    /// Events sent but not yet received.
    pub fn backlog(&self) -> usize {
        self.backlog.load(Ordering::Acquire)
    }
}

impl SourceSenders {
    /// False once the dispatcher has gone away.
    pub fn emit(&self, ev: ChangeEvent) -> bool {
        metrics::counter!("source_events_total", 1u64, "kind" => ev.kind().to_string());
        let depth = self.backlog.fetch_add(1, Ordering::AcqRel) + 1;
        if self.events.send(ev).is_err() {
            self.backlog.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        metrics::gauge!("source_backlog", depth as f64);
        true
    }

    pub fn fault(&self, err: TransportError) {
        tracing::warn!(error = %err.message, "transport fault");
        if self.errors.try_send(err).is_err() {
            metrics::counter!("source_faults_dropped_total", 1u64);
        }
    }

    /// Raise the synced flag. Receivers observe exactly one change no
    /// matter how many relists call this.
    pub fn signal_synced(&self) {
        self.synced.send_if_modified(|v| !std::mem::replace(v, true));
    }
}

/// A list-then-watch producer of [`ChangeEvent`]s.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Spawn the background listing and watch. Cancelling `cancel` (or
    /// calling [`stop`](EventSource::stop)) ends it.
    async fn start(&self, cancel: CancellationToken) -> Result<SourceStreams, StartupError>;

    /// Cooperative shutdown. Idempotent.
    fn stop(&self);
}

/// Shared start/stop bookkeeping for sources.
#[derive(Debug, Default)]
pub(crate) struct RunGuard {
    token: Mutex<Option<CancellationToken>>,
}

impl RunGuard {
    pub fn arm(&self, parent: &CancellationToken) -> CancellationToken {
        let token = parent.child_token();
        let mut slot = self.token.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(prev) = slot.replace(token.clone()) {
            prev.cancel();
        }
        token
    }

    pub fn stop(&self) {
        if let Some(t) = self.token.lock().unwrap_or_else(|p| p.into_inner()).as_ref() {
            t.cancel();
        }
    }
}
