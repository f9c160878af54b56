//! Startup sequencing, ordering and isolation of the dispatcher, driven by
//! the scripted event source.

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::io::{self, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rollwatch_core::{
    ChangeKind, HandlerError, MalformedEntry, ResourceIdentity, ResourceSnapshot, SharedSnapshot, StartupError,
    SubEntity, WatchConfig,
};
use rollwatch_dispatch::{ChannelSink, Dispatcher, EventHandler, SinkNotice, WriterSink};
use rollwatch_kubehub::{ScriptStep, ScriptedSource, SyncBehaviour};
use rollwatch_store::LocalCache;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<(ResourceIdentity, ChangeKind, Instant)>>,
    jitter: bool,
}

impl Recorder {
    fn jittery() -> Self {
        Self { jitter: true, ..Self::default() }
    }

    async fn note(&self, id: &ResourceIdentity, kind: ChangeKind) -> Result<(), HandlerError> {
        if self.jitter {
            let mut h = std::collections::hash_map::DefaultHasher::new();
            (id, kind).hash(&mut h);
            tokio::time::sleep(Duration::from_millis(h.finish() % 15)).await;
        }
        match id.name.as_str() {
            "bad" => return Err(HandlerError::Failed("refused".into())),
            "boom" => panic!("handler exploded"),
            _ => {}
        }
        self.seen.lock().unwrap().push((id.clone(), kind, Instant::now()));
        Ok(())
    }

    fn kinds_by_identity(&self) -> BTreeMap<String, Vec<ChangeKind>> {
        let mut out: BTreeMap<String, Vec<ChangeKind>> = BTreeMap::new();
        for (id, kind, _) in self.seen.lock().unwrap().iter() {
            out.entry(id.to_string()).or_default().push(*kind);
        }
        out
    }
}

#[async_trait]
impl EventHandler for Recorder {
    async fn on_add(&self, id: &ResourceIdentity, _snap: &SharedSnapshot) -> Result<(), HandlerError> {
        self.note(id, ChangeKind::Add).await
    }

    async fn on_update(&self, id: &ResourceIdentity, _old: &SharedSnapshot, _new: &SharedSnapshot) -> Result<(), HandlerError> {
        self.note(id, ChangeKind::Update).await
    }

    async fn on_delete(&self, id: &ResourceIdentity, _last: Option<&SharedSnapshot>) -> Result<(), HandlerError> {
        self.note(id, ChangeKind::Delete).await
    }
}

fn id(name: &str) -> ResourceIdentity {
    ResourceIdentity::new("default", name)
}

fn snap(name: &str) -> ResourceSnapshot {
    ResourceSnapshot::new(id(name))
}

fn deploy(name: &str, containers: &[(&str, &str)]) -> ResourceSnapshot {
    containers
        .iter()
        .fold(snap(name), |s, (c, image)| s.with_sub_entity(SubEntity::new(*c).with_field("image", *image)))
}

fn config(sync_timeout: Duration) -> WatchConfig {
    WatchConfig { sync_timeout, ..WatchConfig::default() }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn no_handler_runs_before_sync_then_existing_objects_are_added() {
    let cache = LocalCache::new();
    let source = ScriptedSource::new(cache.clone())
        .with_initial(vec![snap("a"), snap("b"), snap("c")])
        .sync(SyncBehaviour::After(Duration::from_millis(300)))
        .close_when_done(true);
    let rec = Arc::new(Recorder::default());
    let d = Dispatcher::new(Arc::new(source), rec.clone(), cache.clone(), &config(Duration::from_secs(5)));

    let t0 = Instant::now();
    let report = d.run(CancellationToken::new()).await.unwrap();

    let seen = rec.seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 3);
    assert!(seen.iter().all(|(_, kind, _)| *kind == ChangeKind::Add));
    assert!(seen.iter().all(|(_, _, at)| at.duration_since(t0) >= Duration::from_millis(250)));
    assert_eq!(report.processed, 3);
    assert_eq!(report.failed, 0);
    assert_eq!(report.cached, 3);
}

#[tokio::test]
async fn sync_timeout_registers_no_handlers() {
    let cache = LocalCache::new();
    let source = ScriptedSource::new(cache.clone()).with_initial(vec![snap("a")]).sync(SyncBehaviour::Never);
    let rec = Arc::new(Recorder::default());
    let d = Dispatcher::new(Arc::new(source), rec.clone(), cache, &config(Duration::from_millis(200)));

    let err = d.run(CancellationToken::new()).await.unwrap_err();
    assert_eq!(err, StartupError::SyncTimeout(Duration::from_millis(200)));
    assert!(rec.seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn cancel_during_sync_wait_is_reported() {
    let cache = LocalCache::new();
    let source = ScriptedSource::new(cache.clone()).sync(SyncBehaviour::Never);
    let rec = Arc::new(Recorder::default());
    let d = Dispatcher::new(Arc::new(source), rec.clone(), cache, &config(Duration::from_secs(10)));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });
    assert_eq!(d.run(cancel).await.unwrap_err(), StartupError::Cancelled);
    assert!(rec.seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn failed_start_surfaces_connect_error() {
    let cache = LocalCache::new();
    let source = ScriptedSource::new(cache.clone()).fail_start(StartupError::Connect("no route to apiserver".into()));
    let d = Dispatcher::new(Arc::new(source), Arc::new(Recorder::default()), cache, &config(Duration::from_secs(1)));

    match d.run(CancellationToken::new()).await {
        Err(StartupError::Connect(msg)) => assert!(msg.contains("apiserver")),
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn events_for_one_identity_are_handled_in_delivery_order() {
    let cache = LocalCache::new();
    let names: Vec<String> = (0..12).map(|i| format!("app-{i}")).collect();
    let mut steps = Vec::new();
    for rv in ["1", "2", "3"] {
        for n in &names {
            steps.push(ScriptStep::Apply(snap(n).with_resource_version(rv)));
        }
    }
    for n in &names {
        steps.push(ScriptStep::Delete(id(n)));
    }
    let source = ScriptedSource::new(cache.clone()).with_live(steps).close_when_done(true);
    let rec = Arc::new(Recorder::jittery());
    let cfg = WatchConfig { workers: 4, ..config(Duration::from_secs(5)) };
    let d = Dispatcher::new(Arc::new(source), rec.clone(), cache.clone(), &cfg);

    let report = d.run(CancellationToken::new()).await.unwrap();
    assert_eq!(report.processed, 48);
    assert!(cache.is_empty());

    let expected = vec![ChangeKind::Add, ChangeKind::Update, ChangeKind::Update, ChangeKind::Delete];
    let by_id = rec.kinds_by_identity();
    assert_eq!(by_id.len(), names.len());
    for (who, kinds) in by_id {
        assert_eq!(kinds, expected, "out-of-order delivery for {who}");
    }
}

#[tokio::test]
async fn interleaved_add_update_delete_keeps_per_identity_order() {
    let cache = LocalCache::new();
    let source = ScriptedSource::new(cache.clone())
        .then(ScriptStep::Apply(snap("id1")))
        .then(ScriptStep::Apply(snap("id2")))
        .then(ScriptStep::Apply(snap("id1").with_resource_version("2")))
        .then(ScriptStep::Delete(id("id2")))
        .close_when_done(true);
    let rec = Arc::new(Recorder::jittery());
    let d = Dispatcher::new(Arc::new(source), rec.clone(), cache, &config(Duration::from_secs(5)));
    d.run(CancellationToken::new()).await.unwrap();

    let by_id = rec.kinds_by_identity();
    assert_eq!(by_id["default/id1"], vec![ChangeKind::Add, ChangeKind::Update]);
    assert_eq!(by_id["default/id2"], vec![ChangeKind::Add, ChangeKind::Delete]);
}

#[tokio::test]
async fn failing_and_panicking_handlers_do_not_stop_delivery() {
    let cache = LocalCache::new();
    let source = ScriptedSource::new(cache.clone())
        .then(ScriptStep::Apply(snap("good-1")))
        .then(ScriptStep::Apply(snap("bad")))
        .then(ScriptStep::Apply(snap("boom")))
        .then(ScriptStep::Apply(snap("good-2")))
        .then(ScriptStep::Apply(snap("good-1").with_resource_version("2")))
        .close_when_done(true);
    let rec = Arc::new(Recorder::default());
    let d = Dispatcher::new(Arc::new(source), rec.clone(), cache.clone(), &config(Duration::from_secs(5)));

    let report = d.run(CancellationToken::new()).await.unwrap();
    assert_eq!(report.processed, 3);
    assert_eq!(report.failed, 2);
    assert_eq!(cache.len(), 4);
    let by_id = rec.kinds_by_identity();
    assert_eq!(by_id["default/good-1"], vec![ChangeKind::Add, ChangeKind::Update]);
    assert_eq!(by_id["default/good-2"], vec![ChangeKind::Add]);
}

#[tokio::test]
async fn transport_faults_are_counted_and_cache_is_kept() {
    let cache = LocalCache::new();
    let source = ScriptedSource::new(cache.clone())
        .with_initial(vec![snap("a")])
        .then(ScriptStep::Fault("connection reset".into()))
        .then(ScriptStep::Apply(snap("b")))
        .then(ScriptStep::Fault("watch expired".into()))
        .then(ScriptStep::Pause(Duration::from_millis(20)))
        .close_when_done(true);
    let rec = Arc::new(Recorder::default());
    let d = Dispatcher::new(Arc::new(source), rec.clone(), cache.clone(), &config(Duration::from_secs(5)));

    let report = d.run(CancellationToken::new()).await.unwrap();
    assert_eq!(report.transport_errors, 2);
    assert_eq!(report.processed, 2);
    assert_eq!(report.cached, 2);
    assert!(cache.contains(&id("a")) && cache.contains(&id("b")));
}

#[tokio::test]
async fn reordered_containers_report_only_the_changed_image() {
    let cache = LocalCache::new();
    let source = ScriptedSource::new(cache.clone())
        .with_initial(vec![deploy("web", &[("a", "x"), ("b", "y")])])
        .then(ScriptStep::Apply(deploy("web", &[("b", "y"), ("a", "z")]).with_resource_version("2")))
        .then(ScriptStep::Delete(id("web")))
        .close_when_done(true);
    let (sink, mut notices) = ChannelSink::new(16);
    let d = Dispatcher::with_sink(Arc::new(source), Arc::new(sink), cache, &config(Duration::from_secs(5)));

    let report = d.run(CancellationToken::new()).await.unwrap();
    assert_eq!(report.processed, 3);

    let mut got = Vec::new();
    while let Ok(n) = notices.try_recv() {
        got.push(n);
    }
    assert_eq!(got.len(), 3, "{got:?}");
    assert!(matches!(&got[0], SinkNotice::Created { snapshot, .. } if snapshot.sub_entities.len() == 2));
    match &got[1] {
        SinkNotice::Changed { identity, records, .. } => {
            assert_eq!(identity, &id("web"));
            assert_eq!(records.len(), 1);
            assert_eq!(records[0].sub_entity, "a");
            assert_eq!(records[0].field, "image");
            assert_eq!(records[0].old_value.as_deref(), Some("x"));
            assert_eq!(records[0].new_value.as_deref(), Some("z"));
        }
        other => panic!("expected a change notice, got {other:?}"),
    }
    assert!(matches!(&got[2], SinkNotice::Deleted { identity, .. } if identity == &id("web")));
}

#[tokio::test]
async fn malformed_update_still_forwards_matched_changes() {
    let cache = LocalCache::new();
    let mut broken = deploy("api", &[("main", "api:2")]).with_resource_version("2");
    broken.malformed.push(MalformedEntry { index: Some(1), reason: "sub-entity has no string name".into() });
    let source = ScriptedSource::new(cache.clone())
        .with_initial(vec![deploy("api", &[("main", "api:1")])])
        .then(ScriptStep::Apply(broken))
        .close_when_done(true);
    let (sink, mut notices) = ChannelSink::new(16);
    let d = Dispatcher::with_sink(Arc::new(source), Arc::new(sink), cache, &config(Duration::from_secs(5)));

    let report = d.run(CancellationToken::new()).await.unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(report.failed, 1);

    let _created = notices.try_recv().unwrap();
    match notices.try_recv().unwrap() {
        SinkNotice::Changed { records, .. } => {
            assert_eq!(records.len(), 1);
            assert_eq!(records[0].new_value.as_deref(), Some("api:2"));
        }
        other => panic!("expected a change notice, got {other:?}"),
    }
}

#[tokio::test]
async fn full_sink_queue_drops_notices_without_stalling() {
    let cache = LocalCache::new();
    let steps = (0..20).map(|i| ScriptStep::Apply(snap(&format!("r{i}")))).collect();
    let source = ScriptedSource::new(cache.clone()).with_live(steps).close_when_done(true);
    let (sink, mut notices) = ChannelSink::new(4);
    let d = Dispatcher::with_sink(Arc::new(source), Arc::new(sink), cache, &config(Duration::from_secs(5)));

    let report = tokio::time::timeout(Duration::from_secs(5), d.run(CancellationToken::new())).await.unwrap().unwrap();
    assert_eq!(report.processed, 20);
    let mut delivered = 0;
    while notices.try_recv().is_ok() {
        delivered += 1;
    }
    assert_eq!(delivered, 4);
}

/// Handler that takes a while and records completion.
#[derive(Default)]
struct Slow {
    finished: AtomicUsize,
}

#[async_trait]
impl EventHandler for Slow {
    async fn on_add(&self, _id: &ResourceIdentity, _snap: &SharedSnapshot) -> Result<(), HandlerError> {
        tokio::time::sleep(Duration::from_millis(300)).await;
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn on_update(&self, _id: &ResourceIdentity, _old: &SharedSnapshot, _new: &SharedSnapshot) -> Result<(), HandlerError> {
        Ok(())
    }

    async fn on_delete(&self, _id: &ResourceIdentity, _last: Option<&SharedSnapshot>) -> Result<(), HandlerError> {
        Ok(())
    }
}

#[tokio::test]
async fn shutdown_lets_in_flight_handler_finish() {
    let cache = LocalCache::new();
    let source = ScriptedSource::new(cache.clone()).with_initial(vec![snap("slow")]);
    let handler = Arc::new(Slow::default());
    let d = Dispatcher::new(Arc::new(source), handler.clone(), cache, &config(Duration::from_secs(5)));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });
    let report = d.run(cancel).await.unwrap();
    assert_eq!(handler.finished.load(Ordering::SeqCst), 1);
    assert_eq!(report.processed, 1);
    assert_eq!(report.failed, 0);
}

/// A writer that never comes back, like a terminal nobody reads.
struct Stalled;

impl Write for Stalled {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        std::thread::sleep(Duration::from_secs(3600));
        Ok(0)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn stalled_writer_does_not_block_shutdown() {
    let cache = LocalCache::new();
    let source = ScriptedSource::new(cache.clone())
        .with_initial(vec![snap("a"), snap("b")])
        .then(ScriptStep::Apply(snap("a").with_resource_version("2")));
    let (sink, _writer) = WriterSink::json_lines(Stalled, 1).unwrap();
    let d = Dispatcher::with_sink(Arc::new(source), Arc::new(sink), cache, &config(Duration::from_secs(5)));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });
    let report = tokio::time::timeout(Duration::from_secs(3), d.run(cancel))
        .await
        .expect("dispatcher must return after cancel even when the writer is stuck")
        .unwrap();
    assert_eq!(report.processed, 3);
}

#[tokio::test]
async fn pod_phase_transition_reaches_the_sink() {
    let pod = |phase: &str| {
        ResourceSnapshot::new(id("web-0"))
            .with_sub_entity(SubEntity::new("app").with_field("image", "nginx:1"))
            .with_field("status.phase", phase)
    };
    let cache = LocalCache::new();
    let source = ScriptedSource::new(cache.clone())
        .with_initial(vec![pod("Pending")])
        .then(ScriptStep::Apply(pod("Running").with_resource_version("2")))
        .close_when_done(true);
    let (sink, mut notices) = ChannelSink::new(16);
    let d = Dispatcher::with_sink(Arc::new(source), Arc::new(sink), cache, &config(Duration::from_secs(5)));

    let report = d.run(CancellationToken::new()).await.unwrap();
    assert_eq!(report.processed, 2);

    assert!(matches!(notices.try_recv().unwrap(), SinkNotice::Created { .. }));
    match notices.try_recv().unwrap() {
        SinkNotice::ResourceChanged { identity, changes, .. } => {
            assert_eq!(identity, id("web-0"));
            assert_eq!(changes.len(), 1);
            assert_eq!(changes[0].field, "status.phase");
            assert_eq!(changes[0].old_value.as_deref(), Some("Pending"));
            assert_eq!(changes[0].new_value.as_deref(), Some("Running"));
        }
        other => panic!("expected a resource change notice, got {other:?}"),
    }
    assert!(notices.try_recv().is_err(), "no container record expected");
}
