//! Notice consumers. Sinks are fire-and-forget: a failure is reported to the
//! dispatcher, which logs it, and never blocks or stops event delivery.
//!
//! Anything that can block (stdout, files, sockets) goes through
//! [`WriterSink`], which queues notices for a dedicated writer thread.

use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rollwatch_core::{
    ResourceFieldChange, ResourceIdentity, ResourceSnapshot, SemanticChangeRecord, SinkError, StructuralChange,
};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

pub trait Sink: Send + Sync {
    fn on_create(&self, identity: &ResourceIdentity, snapshot: &ResourceSnapshot) -> Result<(), SinkError>;

    fn on_changes(&self, identity: &ResourceIdentity, records: &[SemanticChangeRecord]) -> Result<(), SinkError>;

    fn on_delete(&self, identity: &ResourceIdentity) -> Result<(), SinkError>;

    /// Sub-entities added or removed by an update. Ignored unless overridden.
    fn on_structure(&self, _identity: &ResourceIdentity, _changes: &[StructuralChange]) -> Result<(), SinkError> {
        Ok(())
    }

    /// Resource-level tracked fields changed by an update. Ignored unless overridden.
    fn on_resource_changes(&self, _identity: &ResourceIdentity, _changes: &[ResourceFieldChange]) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Owned form of one notice, for queues and serialized output.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "notice", rename_all = "snake_case")]
pub enum SinkNotice {
    Created { identity: ResourceIdentity, snapshot: ResourceSnapshot, at: DateTime<Utc> },
    Changed { identity: ResourceIdentity, records: Vec<SemanticChangeRecord>, at: DateTime<Utc> },
    ResourceChanged { identity: ResourceIdentity, changes: Vec<ResourceFieldChange>, at: DateTime<Utc> },
    Deleted { identity: ResourceIdentity, at: DateTime<Utc> },
    Structure { identity: ResourceIdentity, changes: Vec<StructuralChange>, at: DateTime<Utc> },
}

impl SinkNotice {
    pub fn identity(&self) -> &ResourceIdentity {
        match self {
            SinkNotice::Created { identity, .. }
            | SinkNotice::Changed { identity, .. }
            | SinkNotice::ResourceChanged { identity, .. }
            | SinkNotice::Deleted { identity, .. }
            | SinkNotice::Structure { identity, .. } => identity,
        }
    }
}

fn absent(v: &Option<String>) -> &str {
    v.as_deref().unwrap_or("<absent>")
}

/// One line per notice, or per record for multi-record notices.
pub fn render_human(notice: &SinkNotice) -> String {
    match notice {
        SinkNotice::Created { identity, snapshot, .. } => {
            format!("+ {} ({} sub-entities)", identity, snapshot.sub_entities.len())
        }
        SinkNotice::Changed { identity, records, .. } => records
            .iter()
            .map(|r| format!("~ {} {}.{}: {} -> {}", identity, r.sub_entity, r.field, absent(&r.old_value), absent(&r.new_value)))
            .collect::<Vec<_>>()
            .join("\n"),
        SinkNotice::ResourceChanged { identity, changes, .. } => changes
            .iter()
            .map(|c| format!("~ {} {}: {} -> {}", identity, c.field, absent(&c.old_value), absent(&c.new_value)))
            .collect::<Vec<_>>()
            .join("\n"),
        SinkNotice::Deleted { identity, .. } => format!("- {identity}"),
        SinkNotice::Structure { identity, changes, .. } => changes
            .iter()
            .map(|c| match c {
                StructuralChange::Added(name) => format!("  {identity} +{name}"),
                StructuralChange::Removed(name) => format!("  {identity} -{name}"),
            })
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

pub fn render_json(notice: &SinkNotice) -> Result<String, SinkError> {
    Ok(serde_json::to_string(notice)?)
}

/// Structured log lines via `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl Sink for TracingSink {
    fn on_create(&self, identity: &ResourceIdentity, snapshot: &ResourceSnapshot) -> Result<(), SinkError> {
        info!(target: "rollwatch::notice", identity = %identity, sub_entities = snapshot.sub_entities.len(), "resource created");
        Ok(())
    }

    fn on_changes(&self, identity: &ResourceIdentity, records: &[SemanticChangeRecord]) -> Result<(), SinkError> {
        for r in records {
            info!(
                target: "rollwatch::notice",
                identity = %identity,
                sub_entity = %r.sub_entity,
                field = %r.field,
                from = absent(&r.old_value),
                to = absent(&r.new_value),
                "tracked field updated"
            );
        }
        Ok(())
    }

    fn on_delete(&self, identity: &ResourceIdentity) -> Result<(), SinkError> {
        info!(target: "rollwatch::notice", identity = %identity, "resource deleted");
        Ok(())
    }

    fn on_structure(&self, identity: &ResourceIdentity, changes: &[StructuralChange]) -> Result<(), SinkError> {
        for c in changes {
            match c {
                StructuralChange::Added(name) => info!(target: "rollwatch::notice", identity = %identity, sub_entity = %name, "sub-entity added"),
                StructuralChange::Removed(name) => info!(target: "rollwatch::notice", identity = %identity, sub_entity = %name, "sub-entity removed"),
            }
        }
        Ok(())
    }

    fn on_resource_changes(&self, identity: &ResourceIdentity, changes: &[ResourceFieldChange]) -> Result<(), SinkError> {
        for c in changes {
            info!(
                target: "rollwatch::notice",
                identity = %identity,
                field = %c.field,
                from = absent(&c.old_value),
                to = absent(&c.new_value),
                "resource field updated"
            );
        }
        Ok(())
    }
}

/// Bounded queue towards an async consumer. Never waits: a full queue drops
/// the notice and reports [`SinkError::Backpressure`].
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<SinkNotice>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<SinkNotice>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    fn push(&self, notice: SinkNotice) -> Result<(), SinkError> {
        self.tx.try_send(notice).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SinkError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => SinkError::Closed,
        })
    }
}

impl Sink for ChannelSink {
    fn on_create(&self, identity: &ResourceIdentity, snapshot: &ResourceSnapshot) -> Result<(), SinkError> {
        self.push(SinkNotice::Created { identity: identity.clone(), snapshot: snapshot.clone(), at: Utc::now() })
    }

    fn on_changes(&self, identity: &ResourceIdentity, records: &[SemanticChangeRecord]) -> Result<(), SinkError> {
        self.push(SinkNotice::Changed { identity: identity.clone(), records: records.to_vec(), at: Utc::now() })
    }

    fn on_delete(&self, identity: &ResourceIdentity) -> Result<(), SinkError> {
        self.push(SinkNotice::Deleted { identity: identity.clone(), at: Utc::now() })
    }

    fn on_structure(&self, identity: &ResourceIdentity, changes: &[StructuralChange]) -> Result<(), SinkError> {
        self.push(SinkNotice::Structure { identity: identity.clone(), changes: changes.to_vec(), at: Utc::now() })
    }

    fn on_resource_changes(&self, identity: &ResourceIdentity, changes: &[ResourceFieldChange]) -> Result<(), SinkError> {
        self.push(SinkNotice::ResourceChanged { identity: identity.clone(), changes: changes.to_vec(), at: Utc::now() })
    }
}

/// Text output on any blocking writer.
///
/// Notices are queued ([`ChannelSink`] semantics) and written by a dedicated
/// OS thread, so a stalled writer costs dropped notices, never a stalled
/// worker. The thread is detached: a writer stuck forever does not keep the
/// process alive.
#[derive(Debug, Clone)]
pub struct WriterSink {
    queue: ChannelSink,
}

/// Completion of a [`WriterSink`]'s writer thread.
#[derive(Debug)]
pub struct WriterHandle {
    done: oneshot::Receiver<()>,
}

impl WriterSink {
    pub fn spawn<W, F>(out: W, capacity: usize, render: F) -> io::Result<(Self, WriterHandle)>
    where
        W: Write + Send + 'static,
        F: Fn(&SinkNotice) -> Result<String, SinkError> + Send + 'static,
    {
        let (queue, mut rx) = ChannelSink::new(capacity);
        let (done_tx, done_rx) = oneshot::channel();
        std::thread::Builder::new().name("rollwatch-sink-writer".into()).spawn(move || {
            let mut out = out;
            while let Some(notice) = rx.blocking_recv() {
                let written = render(&notice).and_then(|text| -> Result<(), SinkError> {
                    writeln!(out, "{text}")?;
                    out.flush()?;
                    Ok(())
                });
                if let Err(e) = written {
                    metrics::counter!("sink_errors_total", 1u64);
                    warn!(identity = %notice.identity(), error = %e, "sink writer failed; notice dropped");
                }
            }
            debug!("sink writer drained");
            let _ = done_tx.send(());
        })?;
        Ok((Self { queue }, WriterHandle { done: done_rx }))
    }

    /// One JSON object per line.
    pub fn json_lines<W: Write + Send + 'static>(out: W, capacity: usize) -> io::Result<(Self, WriterHandle)> {
        Self::spawn(out, capacity, render_json)
    }

    /// `+`/`~`/`-` prefixed lines for terminals.
    pub fn human<W: Write + Send + 'static>(out: W, capacity: usize) -> io::Result<(Self, WriterHandle)> {
        Self::spawn(out, capacity, |n| Ok(render_human(n)))
    }
}

impl WriterHandle {
    /// Wait for the writer to finish the queue once every sink clone is
    /// dropped. False if it did not finish within `timeout`.
    pub async fn flushed(self, timeout: Duration) -> bool {
        matches!(tokio::time::timeout(timeout, self.done).await, Ok(Ok(())))
    }
}

impl Sink for WriterSink {
    fn on_create(&self, identity: &ResourceIdentity, snapshot: &ResourceSnapshot) -> Result<(), SinkError> {
        self.queue.on_create(identity, snapshot)
    }

    fn on_changes(&self, identity: &ResourceIdentity, records: &[SemanticChangeRecord]) -> Result<(), SinkError> {
        self.queue.on_changes(identity, records)
    }

    fn on_delete(&self, identity: &ResourceIdentity) -> Result<(), SinkError> {
        self.queue.on_delete(identity)
    }

    fn on_structure(&self, identity: &ResourceIdentity, changes: &[StructuralChange]) -> Result<(), SinkError> {
        self.queue.on_structure(identity, changes)
    }

    fn on_resource_changes(&self, identity: &ResourceIdentity, changes: &[ResourceFieldChange]) -> Result<(), SinkError> {
        self.queue.on_resource_changes(identity, changes)
    }
}

/// Forwards every notice to each inner sink; reports the first failure.
#[derive(Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn Sink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn Sink>>) -> Self {
        Self { sinks }
    }

    fn each(&self, f: impl Fn(&dyn Sink) -> Result<(), SinkError>) -> Result<(), SinkError> {
        let mut first = None;
        for s in &self.sinks {
            if let Err(e) = f(s.as_ref()) {
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }
}

impl Sink for FanoutSink {
    fn on_create(&self, identity: &ResourceIdentity, snapshot: &ResourceSnapshot) -> Result<(), SinkError> {
        self.each(|s| s.on_create(identity, snapshot))
    }

    fn on_changes(&self, identity: &ResourceIdentity, records: &[SemanticChangeRecord]) -> Result<(), SinkError> {
        self.each(|s| s.on_changes(identity, records))
    }

    fn on_delete(&self, identity: &ResourceIdentity) -> Result<(), SinkError> {
        self.each(|s| s.on_delete(identity))
    }

    fn on_structure(&self, identity: &ResourceIdentity, changes: &[StructuralChange]) -> Result<(), SinkError> {
        self.each(|s| s.on_structure(identity, changes))
    }

    fn on_resource_changes(&self, identity: &ResourceIdentity, changes: &[ResourceFieldChange]) -> Result<(), SinkError> {
        self.each(|s| s.on_resource_changes(identity, changes))
    }
}
