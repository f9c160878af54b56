//! List+watch over a GVK through kube-rs, kept in step with the local cache.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::StreamExt;
use kube::{
    api::Api,
    core::{DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    runtime::{
        watcher::{self, Event},
        WatchStreamExt,
    },
    Client,
};
use rollwatch_core::{ResourceIdentity, ResourceSnapshot, StartupError, SubEntityLayout, TransportError};
use rollwatch_store::LocalCache;
use tokio::time::{Instant, Interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{channels, EventSource, RunGuard, SourceSenders, SourceStreams};

/// Parse `v1/Kind` or `group/v1/Kind`.
pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] if !version.is_empty() && !kind.is_empty() => {
            Ok(GroupVersionKind { group: String::new(), version: version.to_string(), kind: kind.to_string() })
        }
        [group, version, kind] if !version.is_empty() && !kind.is_empty() => Ok(GroupVersionKind {
            group: (*group).to_string(),
            version: (*version).to_string(),
            kind: (*kind).to_string(),
        }),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(kube::core::ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

fn snapshot_from(obj: &DynamicObject, layout: &SubEntityLayout) -> Option<ResourceSnapshot> {
    let mut raw = match serde_json::to_value(obj) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "serializing DynamicObject failed; object dropped");
            return None;
        }
    };
    strip_managed_fields(&mut raw);
    match layout.build_snapshot(&raw) {
        Ok(snap) => {
            if snap.is_malformed() {
                debug!(identity = %snap.identity, malformed = snap.malformed.len(), "snapshot has unreadable sub-entities");
            }
            Some(snap)
        }
        Err(e) => {
            warn!(error = %e, "unreadable object dropped");
            None
        }
    }
}

fn identity_of(obj: &DynamicObject) -> Option<ResourceIdentity> {
    let name = obj.metadata.name.as_deref()?;
    Some(ResourceIdentity::new(obj.metadata.namespace.clone().unwrap_or_default(), name))
}

/// Event source backed by a kube-rs watcher on one GVK.
pub struct KubeEventSource {
    gvk_key: String,
    namespace: Option<String>,
    resync: Option<Duration>,
    layout: SubEntityLayout,
    cache: Arc<LocalCache>,
    client: Option<Client>,
    run: RunGuard,
}

impl KubeEventSource {
    pub fn new(gvk_key: impl Into<String>, cache: Arc<LocalCache>, cfg: &rollwatch_core::WatchConfig) -> Self {
        Self {
            gvk_key: gvk_key.into(),
            namespace: cfg.resource_scope.clone(),
            resync: cfg.resync_period,
            layout: cfg.layout.clone(),
            cache,
            client: None,
            run: RunGuard::default(),
        }
    }

    /// Use an existing client instead of `Client::try_default()`.
    pub fn with_client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    async fn api(&self) -> Result<Api<DynamicObject>> {
        let client = match &self.client {
            Some(c) => c.clone(),
            None => Client::try_default().await?,
        };
        let gvk = parse_gvk_key(&self.gvk_key)?;
        let (ar, namespaced) = find_api_resource(client.clone(), &gvk).await?;
        let api: Api<DynamicObject> = if namespaced {
            match self.namespace.as_deref() {
                Some(ns) => Api::namespaced_with(client, ns, &ar),
                None => Api::all_with(client, &ar),
            }
        } else {
            Api::all_with(client, &ar)
        };
        Ok(api)
    }
}

#[async_trait]
impl EventSource for KubeEventSource {
    async fn start(&self, cancel: CancellationToken) -> Result<SourceStreams, StartupError> {
        let api = tokio::select! {
            _ = cancel.cancelled() => return Err(StartupError::Cancelled),
            res = self.api() => res.map_err(|e| StartupError::Connect(format!("{e:#}")))?,
        };
        let (tx, streams) = channels();
        let token = self.run.arm(&cancel);
        let pump = WatchPump {
            api,
            layout: self.layout.clone(),
            cache: self.cache.clone(),
            resync: self.resync,
            tx,
            token,
        };
        info!(gvk = %self.gvk_key, ns = ?self.namespace, resync = ?self.resync, "watcher started");
        tokio::spawn(pump.run());
        Ok(streams)
    }

    fn stop(&self) {
        self.run.stop();
    }
}

struct WatchPump {
    api: Api<DynamicObject>,
    layout: SubEntityLayout,
    cache: Arc<LocalCache>,
    resync: Option<Duration>,
    tx: SourceSenders,
    token: CancellationToken,
}

async fn tick(relist: &mut Option<Interval>) {
    match relist {
        Some(i) => {
            i.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

impl WatchPump {
    async fn run(self) {
        let mut relist = self.resync.map(|p| tokio::time::interval_at(Instant::now() + p, p));
        'watch: loop {
            let stream = watcher::watcher(self.api.clone(), watcher::Config::default()).default_backoff();
            futures::pin_mut!(stream);
            loop {
                tokio::select! {
                    _ = self.token.cancelled() => break 'watch,
                    _ = tick(&mut relist) => {
                        debug!("resync period elapsed; restarting watch to relist");
                        continue 'watch;
                    }
                    next = stream.next() => match next {
                        Some(Ok(ev)) => {
                            if !self.handle(ev) {
                                debug!("event receiver dropped; stopping watcher");
                                break 'watch;
                            }
                        }
                        Some(Err(e)) => self.tx.fault(TransportError::new(e.to_string())),
                        None => {
                            warn!("watcher stream ended");
                            break 'watch;
                        }
                    }
                }
            }
        }
        info!("watcher stopped");
    }

    /// Returns false once nobody is listening.
    fn handle(&self, ev: Event<DynamicObject>) -> bool {
        match ev {
            Event::Applied(o) => match snapshot_from(&o, &self.layout) {
                Some(snap) => self.tx.emit(self.cache.observe(snap)),
                None => true,
            },
            Event::Deleted(o) => match identity_of(&o) {
                Some(id) => self.tx.emit(self.cache.forget(id)),
                None => {
                    warn!("deleted object without a name ignored");
                    true
                }
            },
            Event::Restarted(list) => {
                debug!(count = list.len(), "watch restart");
                let snaps: Vec<_> = list.iter().filter_map(|o| snapshot_from(o, &self.layout)).collect();
                for ev in self.cache.replace_all(snaps) {
                    if !self.tx.emit(ev) {
                        return false;
                    }
                }
                self.cache.mark_synced();
                self.tx.signal_synced();
                true
            }
        }
    }
}
