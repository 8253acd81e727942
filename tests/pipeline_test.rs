//! End-to-end behaviour of the reload pipeline with an in-memory watch
//! backend and a recording plugin host. Time is paused so debounce
//! windows are exact.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::{Instant, sleep};

use plugin_reload::reload::{MemoryBackend, PipelineBuilder, ReloadPipeline};
use plugin_reload::{
    EventFilter, FileEvent, FileEventKind, PluginHost, PluginId, ReloadError, ReloadFailure,
    ReloadResult, SkipReason,
};

const QUIET: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    Unload(String),
    Load(String, PathBuf),
}

#[derive(Default)]
struct RecordingHost {
    known: HashSet<String>,
    fail_unload: HashSet<String>,
    load_delay: Option<Duration>,
    panic_on_load: bool,
    calls: Mutex<Vec<(Call, Instant)>>,
}

impl RecordingHost {
    fn knowing(ids: &[&str]) -> Self {
        Self {
            known: ids.iter().map(|id| id.to_string()).collect(),
            ..Self::default()
        }
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().iter().map(|(call, _)| call.clone()).collect()
    }

    fn loads_of(&self, id: &str) -> Vec<Instant> {
        self.calls
            .lock()
            .iter()
            .filter_map(|(call, at)| match call {
                Call::Load(loaded, _) if loaded == id => Some(*at),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl PluginHost for RecordingHost {
    async fn exists(&self, id: &PluginId) -> bool {
        self.known.contains(id.as_str())
    }

    async fn unload(&self, id: &PluginId) -> anyhow::Result<()> {
        self.calls
            .lock()
            .push((Call::Unload(id.to_string()), Instant::now()));
        if self.fail_unload.contains(id.as_str()) {
            return Err(anyhow!("{id} refused to unload"));
        }
        Ok(())
    }

    async fn load(&self, id: &PluginId, path: &Path) -> anyhow::Result<()> {
        self.calls
            .lock()
            .push((Call::Load(id.to_string(), path.to_path_buf()), Instant::now()));
        if let Some(delay) = self.load_delay {
            sleep(delay).await;
        }
        if self.panic_on_load {
            panic!("plugin loader crashed");
        }
        Ok(())
    }
}

fn pipeline(host: &Arc<RecordingHost>, backend: &MemoryBackend) -> ReloadPipeline {
    PipelineBuilder::new()
        .host(host.clone())
        .backend(backend.clone())
        .quiet_period(QUIET)
        .watching(false)
        .build()
        .unwrap()
}

fn modified(path: &str) -> FileEvent {
    FileEvent::new(path, FileEventKind::Modified)
}

#[tokio::test(start_paused = true)]
async fn test_burst_collapses_into_one_reload() {
    let host = Arc::new(RecordingHost::knowing(&["p1"]));
    let backend = MemoryBackend::new();
    let pipeline = pipeline(&host, &backend);
    pipeline.register_plugin("p1", "/plugins/p1/main.lua").await.unwrap();
    let mut outcomes = pipeline.outcomes();

    let start = Instant::now();
    for i in 0..5 {
        if i > 0 {
            sleep(Duration::from_millis(20)).await;
        }
        assert!(pipeline.notify("p1").await.unwrap());
    }

    let outcome = outcomes.recv().await.unwrap();
    assert_eq!(outcome.plugin_id, PluginId::from("p1"));
    assert_eq!(outcome.result, ReloadResult::Reloaded);

    let loads = host.loads_of("p1");
    assert_eq!(loads.len(), 1);
    // Last notify at 80ms, quiet period 100ms
    let fired = loads[0] - start;
    assert!(fired >= Duration::from_millis(180), "fired after {fired:?}");
    assert!(fired < Duration::from_millis(190), "fired after {fired:?}");

    sleep(Duration::from_millis(500)).await;
    assert_eq!(host.loads_of("p1").len(), 1);
    assert_eq!(
        host.calls(),
        vec![
            Call::Unload("p1".to_string()),
            Call::Load("p1".to_string(), PathBuf::from("/plugins/p1/main.lua")),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_file_events_trigger_reload_of_owning_plugin() {
    let host = Arc::new(RecordingHost::knowing(&["p1", "p2"]));
    let backend = MemoryBackend::new();
    let pipeline = pipeline(&host, &backend);
    pipeline.register_plugin("p1", "/plugins/p1/main.lua").await.unwrap();
    pipeline.register_plugin("p2", "/plugins/p2/main.lua").await.unwrap();
    pipeline.enable_watching().await.unwrap();
    let mut outcomes = pipeline.outcomes();

    assert!(backend.emit(modified("/plugins/p1/lib/util.lua")).await);
    assert!(backend.emit(modified("/plugins/p1/main.lua")).await);

    let outcome = outcomes.recv().await.unwrap();
    assert_eq!(outcome.plugin_id, PluginId::from("p1"));
    assert!(outcome.is_reloaded());

    sleep(Duration::from_millis(500)).await;
    assert_eq!(host.loads_of("p1").len(), 1);
    assert!(host.loads_of("p2").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_plugins_debounce_independently() {
    let host = Arc::new(RecordingHost::knowing(&["a", "b"]));
    let backend = MemoryBackend::new();
    let pipeline = pipeline(&host, &backend);
    pipeline.register_plugin("a", "/plugins/a/main.lua").await.unwrap();
    pipeline.register_plugin("b", "/plugins/b/main.lua").await.unwrap();

    let start = Instant::now();
    pipeline.notify("a").await.unwrap();
    sleep(Duration::from_millis(50)).await;
    pipeline.notify("b").await.unwrap();
    // Keep touching b; a must still fire on its own schedule
    sleep(Duration::from_millis(50)).await;
    pipeline.notify("b").await.unwrap();

    sleep(Duration::from_millis(300)).await;

    let a = host.loads_of("a");
    let b = host.loads_of("b");
    assert_eq!(a.len(), 1);
    assert_eq!(b.len(), 1);
    assert_eq!(a[0] - start, Duration::from_millis(100));
    assert_eq!(b[0] - start, Duration::from_millis(200));
}

#[tokio::test(start_paused = true)]
async fn test_nested_plugin_wins_for_its_subtree() {
    let host = Arc::new(RecordingHost::knowing(&["outer", "inner"]));
    let backend = MemoryBackend::new();
    let pipeline = pipeline(&host, &backend);
    pipeline
        .register_plugin("outer", "/plugins/outer/init.lua")
        .await
        .unwrap();
    pipeline
        .register_plugin("inner", "/plugins/outer/inner/init.lua")
        .await
        .unwrap();
    pipeline.enable_watching().await.unwrap();

    // The outer tree covers the inner one
    assert_eq!(
        backend.last_dirs(),
        Some([PathBuf::from("/plugins/outer")].into())
    );

    backend.emit(modified("/plugins/outer/inner/init.lua")).await;
    sleep(Duration::from_millis(300)).await;

    assert_eq!(host.loads_of("inner").len(), 1);
    assert!(host.loads_of("outer").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_filtered_and_unrelated_events_ignored() {
    let host = Arc::new(RecordingHost::knowing(&["p1"]));
    let backend = MemoryBackend::new();
    let pipeline = PipelineBuilder::new()
        .host(host.clone())
        .backend(backend.clone())
        .quiet_period(QUIET)
        .filter(EventFilter::new(["lua"], ["*.swp", "*~"]).unwrap())
        .build()
        .unwrap();
    pipeline.register_plugin("p1", "/plugins/p1/main.lua").await.unwrap();
    pipeline.enable_watching().await.unwrap();

    backend.emit(modified("/plugins/p1/.main.lua.swp")).await;
    backend.emit(modified("/plugins/p1/main.lua~")).await;
    backend.emit(modified("/plugins/p1/README.md")).await;
    backend.emit(modified("/plugins/p10/main.lua")).await;
    backend.emit(modified("/elsewhere/main.lua")).await;

    sleep(Duration::from_millis(300)).await;
    assert!(host.calls().is_empty());
    assert!(pipeline.status().await.unwrap().pending.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_deregister_cancels_pending_reload() {
    let host = Arc::new(RecordingHost::knowing(&["p1", "p2"]));
    let backend = MemoryBackend::new();
    let pipeline = pipeline(&host, &backend);
    pipeline.register_plugin("p1", "/plugins/p1/main.lua").await.unwrap();
    pipeline.enable_watching().await.unwrap();
    let mut outcomes = pipeline.outcomes();

    backend.emit(modified("/plugins/p1/main.lua")).await;
    sleep(Duration::from_millis(50)).await;
    assert!(pipeline.deregister_plugin("p1").await.unwrap());

    sleep(Duration::from_millis(500)).await;
    assert!(host.calls().is_empty());
    assert!(outcomes.try_recv().is_err());

    // Its tree no longer resolves
    backend.emit(modified("/plugins/p1/main.lua")).await;
    backend.emit(modified("/plugins/p1/lib/util.lua")).await;
    sleep(Duration::from_millis(300)).await;
    assert!(host.calls().is_empty());
    assert!(outcomes.try_recv().is_err());
    assert!(pipeline.status().await.unwrap().pending.is_empty());
    assert!(!pipeline.deregister_plugin("p1").await.unwrap());

    // The freed entry path belongs to whoever registers it next
    pipeline.register_plugin("p2", "/plugins/p1/main.lua").await.unwrap();
    backend.emit(modified("/plugins/p1/main.lua")).await;
    let outcome = outcomes.recv().await.unwrap();
    assert_eq!(outcome.plugin_id, PluginId::from("p2"));
    assert!(outcome.is_reloaded());
    assert!(host.loads_of("p1").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_unknown_plugin_is_skipped() {
    let host = Arc::new(RecordingHost::knowing(&[]));
    let backend = MemoryBackend::new();
    let pipeline = pipeline(&host, &backend);
    pipeline
        .register_plugin("ghost", "/plugins/ghost/main.lua")
        .await
        .unwrap();

    let outcome = pipeline.reload_now("ghost").await.unwrap();
    assert_eq!(outcome.result, ReloadResult::Skipped(SkipReason::NotFound));
    assert!(host.calls().is_empty());

    let outcome = pipeline.reload_now("never-registered").await.unwrap();
    assert_eq!(
        outcome.result,
        ReloadResult::Skipped(SkipReason::Unregistered)
    );
    assert!(!pipeline.notify("never-registered").await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_unload_failure_skips_load() {
    let host = Arc::new(RecordingHost {
        fail_unload: ["p1".to_string()].into(),
        ..RecordingHost::knowing(&["p1"])
    });
    let backend = MemoryBackend::new();
    let pipeline = pipeline(&host, &backend);
    pipeline.register_plugin("p1", "/plugins/p1/main.lua").await.unwrap();

    let outcome = pipeline.reload_now("p1").await.unwrap();
    assert_eq!(
        outcome.result,
        ReloadResult::Failed(ReloadFailure::Unload {
            reason: "p1 refused to unload".to_string()
        })
    );
    assert_eq!(host.calls(), vec![Call::Unload("p1".to_string())]);

    // No retry on its own
    sleep(Duration::from_millis(500)).await;
    assert_eq!(host.calls().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_reload_now_replaces_pending_window() {
    let host = Arc::new(RecordingHost::knowing(&["p1"]));
    let backend = MemoryBackend::new();
    let pipeline = pipeline(&host, &backend);
    pipeline.register_plugin("p1", "/plugins/p1/main.lua").await.unwrap();

    pipeline.notify("p1").await.unwrap();
    assert_eq!(
        pipeline.status().await.unwrap().pending,
        vec![PluginId::from("p1")]
    );

    let outcome = pipeline.reload_now("p1").await.unwrap();
    assert!(outcome.is_reloaded());

    sleep(Duration::from_millis(500)).await;
    assert_eq!(host.loads_of("p1").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_change_during_reload_is_deferred() {
    let host = Arc::new(RecordingHost {
        load_delay: Some(Duration::from_millis(200)),
        ..RecordingHost::knowing(&["p1"])
    });
    let backend = MemoryBackend::new();
    let pipeline = pipeline(&host, &backend);
    pipeline.register_plugin("p1", "/plugins/p1/main.lua").await.unwrap();
    let mut outcomes = pipeline.outcomes();

    let manual = {
        let pipeline = pipeline.clone();
        tokio::spawn(async move { pipeline.reload_now("p1").await })
    };
    sleep(Duration::from_millis(10)).await;
    assert_eq!(
        pipeline.status().await.unwrap().in_flight,
        vec![PluginId::from("p1")]
    );

    // No second reload may start while the first is running
    assert!(pipeline.notify("p1").await.unwrap());
    assert!(pipeline.status().await.unwrap().pending.is_empty());

    let first = manual.await.unwrap().unwrap();
    assert!(first.is_reloaded());
    assert_eq!(
        pipeline.status().await.unwrap().pending,
        vec![PluginId::from("p1")]
    );

    assert!(outcomes.recv().await.unwrap().is_reloaded());
    assert!(outcomes.recv().await.unwrap().is_reloaded());
    assert_eq!(host.loads_of("p1").len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_reload_now_joins_in_flight_attempt() {
    let host = Arc::new(RecordingHost {
        load_delay: Some(Duration::from_millis(200)),
        ..RecordingHost::knowing(&["p1"])
    });
    let backend = MemoryBackend::new();
    let pipeline = pipeline(&host, &backend);
    pipeline.register_plugin("p1", "/plugins/p1/main.lua").await.unwrap();

    let (first, second) = tokio::join!(pipeline.reload_now("p1"), pipeline.reload_now("p1"));

    assert_eq!(first.unwrap(), second.unwrap());
    assert_eq!(host.loads_of("p1").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_panicking_host_reports_interrupted() {
    let host = Arc::new(RecordingHost {
        panic_on_load: true,
        ..RecordingHost::knowing(&["p1"])
    });
    let backend = MemoryBackend::new();
    let pipeline = pipeline(&host, &backend);
    pipeline.register_plugin("p1", "/plugins/p1/main.lua").await.unwrap();

    let outcome = pipeline.reload_now("p1").await.unwrap();
    assert!(matches!(
        outcome.result,
        ReloadResult::Failed(ReloadFailure::Interrupted { .. })
    ));

    // The pipeline keeps running
    assert!(pipeline.status().await.unwrap().in_flight.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_disable_watching_is_idempotent() {
    let host = Arc::new(RecordingHost::knowing(&["p1"]));
    let backend = MemoryBackend::new();
    let pipeline = pipeline(&host, &backend);
    pipeline.register_plugin("p1", "/plugins/p1/main.lua").await.unwrap();

    pipeline.enable_watching().await.unwrap();
    pipeline.enable_watching().await.unwrap();
    assert_eq!(backend.watch_count(), 1);

    pipeline.notify("p1").await.unwrap();
    pipeline.disable_watching().await.unwrap();
    pipeline.disable_watching().await.unwrap();

    assert_eq!(backend.release_count(), 1);
    assert_eq!(backend.active_count(), 0);

    // The pending window died with the session
    sleep(Duration::from_millis(500)).await;
    assert!(host.calls().is_empty());

    let status = pipeline.status().await.unwrap();
    assert!(!status.watching);
    assert!(status.watched_dirs.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_registration_follows_watch() {
    let host = Arc::new(RecordingHost::knowing(&["p1", "p2"]));
    let backend = MemoryBackend::new();
    let pipeline = pipeline(&host, &backend);
    pipeline.register_plugin("p1", "/plugins/p1/main.lua").await.unwrap();
    pipeline.enable_watching().await.unwrap();

    pipeline.register_plugin("p2", "/plugins/p2/main.lua").await.unwrap();
    assert_eq!(backend.watch_count(), 2);
    assert_eq!(backend.active_count(), 1);
    assert_eq!(
        backend.last_dirs(),
        Some([PathBuf::from("/plugins/p1"), PathBuf::from("/plugins/p2")].into())
    );

    pipeline.deregister_plugin("p1").await.unwrap();
    assert_eq!(
        backend.last_dirs(),
        Some([PathBuf::from("/plugins/p2")].into())
    );
}

#[tokio::test(start_paused = true)]
async fn test_watch_failure_leaves_manual_reload_working() {
    let host = Arc::new(RecordingHost::knowing(&["p1"]));
    let backend = MemoryBackend::new();
    let pipeline = pipeline(&host, &backend);
    pipeline.register_plugin("p1", "/plugins/p1/main.lua").await.unwrap();

    backend.fail_next("too many open files");
    let err = pipeline.enable_watching().await.unwrap_err();
    assert!(matches!(err, ReloadError::WatchSetup { .. }));
    assert!(!pipeline.status().await.unwrap().watching);
    assert!(!backend.emit(modified("/plugins/p1/main.lua")).await);

    let outcome = pipeline.reload_now("p1").await.unwrap();
    assert!(outcome.is_reloaded());

    // Retrying works once the backend recovers
    pipeline.enable_watching().await.unwrap();
    assert!(pipeline.status().await.unwrap().watching);
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_path_rejected() {
    let host = Arc::new(RecordingHost::knowing(&["p1", "p2"]));
    let backend = MemoryBackend::new();
    let pipeline = pipeline(&host, &backend);
    pipeline.register_plugin("p1", "/plugins/p1/main.lua").await.unwrap();

    let err = pipeline
        .register_plugin("p2", "/plugins/p1/main.lua")
        .await
        .unwrap_err();
    assert!(matches!(err, ReloadError::DuplicatePath { .. }));

    // Moving p1 frees its old tree
    pipeline.register_plugin("p1", "/plugins/moved/main.lua").await.unwrap();
    pipeline.register_plugin("p2", "/plugins/p1/main.lua").await.unwrap();

    let status = pipeline.status().await.unwrap();
    assert_eq!(
        status.plugins,
        vec![
            (PluginId::from("p1"), PathBuf::from("/plugins/moved/main.lua")),
            (PluginId::from("p2"), PathBuf::from("/plugins/p1/main.lua")),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_subscribers_receive_every_outcome() {
    let host = Arc::new(RecordingHost::knowing(&["p1"]));
    let backend = MemoryBackend::new();
    let pipeline = pipeline(&host, &backend);
    pipeline.register_plugin("p1", "/plugins/p1/main.lua").await.unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    pipeline
        .subscribe(move |outcome| sink.lock().push(outcome.clone()))
        .await
        .unwrap();

    pipeline.reload_now("p1").await.unwrap();
    pipeline.reload_now("ghost").await.unwrap();

    let seen = seen.lock();
    assert_eq!(seen.len(), 2);
    assert!(seen[0].is_reloaded());
    assert_eq!(
        seen[1].result,
        ReloadResult::Skipped(SkipReason::Unregistered)
    );
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_waits_for_in_flight_reload() {
    let host = Arc::new(RecordingHost {
        load_delay: Some(Duration::from_millis(200)),
        ..RecordingHost::knowing(&["p1"])
    });
    let backend = MemoryBackend::new();
    let pipeline = pipeline(&host, &backend);
    pipeline.register_plugin("p1", "/plugins/p1/main.lua").await.unwrap();
    pipeline.enable_watching().await.unwrap();
    let mut outcomes = pipeline.outcomes();

    let manual = {
        let pipeline = pipeline.clone();
        tokio::spawn(async move { pipeline.reload_now("p1").await })
    };
    sleep(Duration::from_millis(10)).await;

    pipeline.shutdown().await.unwrap();

    assert!(outcomes.try_recv().unwrap().is_reloaded());
    assert!(manual.await.unwrap().unwrap().is_reloaded());
    assert_eq!(backend.release_count(), 1);

    assert!(matches!(
        pipeline.status().await,
        Err(ReloadError::PipelineClosed)
    ));
    // Second shutdown is a no-op
    pipeline.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_dropping_last_handle_stops_pipeline() {
    let host = Arc::new(RecordingHost::knowing(&["p1"]));
    let backend = MemoryBackend::new();
    {
        let pipeline = pipeline(&host, &backend);
        pipeline.register_plugin("p1", "/plugins/p1/main.lua").await.unwrap();
        pipeline.enable_watching().await.unwrap();
        pipeline.notify("p1").await.unwrap();
    }

    sleep(Duration::from_millis(500)).await;
    assert_eq!(backend.release_count(), 1);
    assert!(host.calls().is_empty());
}

#[tokio::test]
async fn test_builder_requires_host() {
    let result = PipelineBuilder::new().build();
    assert!(matches!(result, Err(ReloadError::Config { .. })));
}

#[test]
fn test_builder_requires_runtime() {
    let result = PipelineBuilder::new()
        .host(Arc::new(RecordingHost::default()))
        .backend(MemoryBackend::new())
        .build();
    assert!(matches!(result, Err(ReloadError::Config { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_builder_watches_by_default() {
    let host = Arc::new(RecordingHost::knowing(&["p1"]));
    let backend = MemoryBackend::new();
    let pipeline = PipelineBuilder::new()
        .host(host.clone())
        .backend(backend.clone())
        .quiet_period(QUIET)
        .build()
        .unwrap();

    assert!(pipeline.status().await.unwrap().watching);
    assert_eq!(backend.watch_count(), 1);

    pipeline.register_plugin("p1", "/plugins/p1/main.lua").await.unwrap();
    assert!(backend.emit(modified("/plugins/p1/main.lua")).await);
    sleep(Duration::from_millis(300)).await;
    assert_eq!(host.loads_of("p1").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_preregistered_plugins_and_initial_watch() {
    let host = Arc::new(RecordingHost::knowing(&["p1"]));
    let backend = MemoryBackend::new();
    let pipeline = PipelineBuilder::new()
        .host(host.clone())
        .backend(backend.clone())
        .quiet_period(QUIET)
        .plugin("p1", "/plugins/p1/main.lua")
        .watching(true)
        .build()
        .unwrap();

    let status = pipeline.status().await.unwrap();
    assert!(status.watching);
    assert_eq!(status.watched_dirs, vec![PathBuf::from("/plugins/p1")]);

    backend.emit(modified("/plugins/p1/main.lua")).await;
    sleep(Duration::from_millis(300)).await;
    assert_eq!(host.loads_of("p1").len(), 1);
}
