//! A deterministic event source: a fixed initial listing, a configurable
//! sync moment, then a scripted sequence of live changes. Backs the
//! `replay` command and the dispatcher tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rollwatch_core::{ResourceIdentity, ResourceSnapshot, StartupError, TransportError};
use rollwatch_store::LocalCache;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{channels, EventSource, RunGuard, SourceSenders, SourceStreams};

/// When the synced flag fires relative to the initial listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncBehaviour {
    Immediate,
    After(Duration),
    Never,
}

#[derive(Debug, Clone)]
pub enum ScriptStep {
    /// Create or update; the cache decides which.
    Apply(ResourceSnapshot),
    Delete(ResourceIdentity),
    Fault(String),
    Pause(Duration),
}

pub struct ScriptedSource {
    cache: Arc<LocalCache>,
    initial: Vec<ResourceSnapshot>,
    live: Vec<ScriptStep>,
    sync: SyncBehaviour,
    close_when_done: bool,
    fail_start: Option<StartupError>,
    run: RunGuard,
}

impl ScriptedSource {
    pub fn new(cache: Arc<LocalCache>) -> Self {
        Self {
            cache,
            initial: Vec::new(),
            live: Vec::new(),
            sync: SyncBehaviour::Immediate,
            close_when_done: false,
            fail_start: None,
            run: RunGuard::default(),
        }
    }

    pub fn with_initial(mut self, listing: Vec<ResourceSnapshot>) -> Self {
        self.initial = listing;
        self
    }

    pub fn with_live(mut self, steps: Vec<ScriptStep>) -> Self {
        self.live = steps;
        self
    }

    pub fn then(mut self, step: ScriptStep) -> Self {
        self.live.push(step);
        self
    }

    pub fn sync(mut self, sync: SyncBehaviour) -> Self {
        self.sync = sync;
        self
    }

    /// Close the event stream after the last step instead of idling until stopped.
    pub fn close_when_done(mut self, close: bool) -> Self {
        self.close_when_done = close;
        self
    }

    /// Make `start` fail, as a source that cannot reach its cluster would.
    pub fn fail_start(mut self, err: StartupError) -> Self {
        self.fail_start = Some(err);
        self
    }
}

#[async_trait]
impl EventSource for ScriptedSource {
    async fn start(&self, cancel: CancellationToken) -> Result<SourceStreams, StartupError> {
        if let Some(err) = &self.fail_start {
            return Err(err.clone());
        }
        let (tx, streams) = channels();
        let token = self.run.arm(&cancel);
        let player = Player {
            cache: self.cache.clone(),
            initial: self.initial.clone(),
            live: self.live.clone(),
            sync: self.sync,
            close_when_done: self.close_when_done,
            tx,
            token,
        };
        tokio::spawn(player.run());
        Ok(streams)
    }

    fn stop(&self) {
        self.run.stop();
    }
}

struct Player {
    cache: Arc<LocalCache>,
    initial: Vec<ResourceSnapshot>,
    live: Vec<ScriptStep>,
    sync: SyncBehaviour,
    close_when_done: bool,
    tx: SourceSenders,
    token: CancellationToken,
}

impl Player {
    /// Sleep unless cancelled first; false when cancelled.
    async fn pause(&self, d: Duration) -> bool {
        tokio::select! {
            _ = self.token.cancelled() => false,
            _ = tokio::time::sleep(d) => true,
        }
    }

    async fn run(self) {
        let listed = self.initial.len();
        for ev in self.cache.replace_all(self.initial.clone()) {
            if !self.tx.emit(ev) {
                return;
            }
        }
        match self.sync {
            SyncBehaviour::Immediate => {}
            SyncBehaviour::After(d) => {
                if !self.pause(d).await {
                    return;
                }
            }
            SyncBehaviour::Never => {
                debug!("scripted source will never sync");
                self.token.cancelled().await;
                return;
            }
        }
        self.cache.mark_synced();
        self.tx.signal_synced();
        info!(listed, "scripted source synced");

        for step in &self.live {
            if self.token.is_cancelled() {
                return;
            }
            let alive = match step {
                ScriptStep::Apply(snap) => self.tx.emit(self.cache.observe(snap.clone())),
                ScriptStep::Delete(id) => self.tx.emit(self.cache.forget(id.clone())),
                ScriptStep::Fault(msg) => {
                    self.tx.fault(TransportError::new(msg.clone()));
                    true
                }
                ScriptStep::Pause(d) => self.pause(*d).await,
            };
            if !alive {
                return;
            }
        }
        if !self.close_when_done {
            self.token.cancelled().await;
        }
        debug!("scripted source finished");
    }
}
