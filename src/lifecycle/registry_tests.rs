use super::*;
use crate::protocol::CapabilityObject;
use std::sync::atomic::{AtomicUsize, Ordering};
use crate::test_utils::{ConnectionScript, FakeData};
use std::sync::Mutex as StdMutex;

const TICK: Duration = Duration::from_millis(10);

/// Provider whose factories build handles over `script`
fn scripted_provider(script: Arc<ConnectionScript>) -> MockBackendFactoryProvider {
    let mut provider = MockBackendFactoryProvider::new();
    provider.expect_backend_factory().returning(move |_| {
        let script = script.clone();
        let factory: PluginFactory = Arc::new(move |descriptor: PluginDescriptor, _env: EnvFn| {
            Ok(Arc::new(script.handle(descriptor)) as Arc<dyn BackendPlugin>)
        });
        Some(factory)
    });
    provider
}

/// Provider that takes longer to answer on each call, so concurrent
/// registrations overlap
struct SlowProvider {
    script: Arc<ConnectionScript>,
    calls: AtomicUsize,
}

#[async_trait]
impl BackendFactoryProvider for SlowProvider {
    async fn backend_factory(&self, _descriptor: &PluginDescriptor) -> Option<PluginFactory> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) as u64;
        tokio::time::sleep(Duration::from_millis(5 + 15 * call)).await;
        let script = self.script.clone();
        let factory: PluginFactory = Arc::new(move |descriptor: PluginDescriptor, _env: EnvFn| {
            Ok(Arc::new(script.handle(descriptor)) as Arc<dyn BackendPlugin>)
        });
        Some(factory)
    }
}

async fn wait_for(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(TICK).await;
    }
    false
}

fn registry(script: Arc<ConnectionScript>) -> Registry {
    Registry::new(
        Supervisor::new(TICK),
        Arc::new(scripted_provider(script)),
        Arc::new(HostEnv::default()),
    )
}

#[tokio::test]
async fn test_register_starts_managed_plugin() {
    let script = ConnectionScript::healthy();
    let registry = registry(script.clone());

    registry
        .register(PluginDescriptor::new("p", "/bin/p"))
        .await
        .unwrap();

    assert_eq!(script.starts(), 1);
    assert_eq!(registry.ids().await, vec!["p"]);
    let plugin = registry.get("p").await.unwrap();
    assert!(!plugin.exited().await);

    registry.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_registration_conflicts() {
    let script = ConnectionScript::healthy();
    let registry = registry(script.clone());
    registry
        .register(PluginDescriptor::new("p", "/bin/p"))
        .await
        .unwrap();

    let err = registry
        .register(PluginDescriptor::new("p", "/bin/other"))
        .await
        .unwrap_err();

    assert!(matches!(err, PluginError::Conflict(ref id) if id == "p"));
    assert_eq!(registry.len().await, 1);
    assert_eq!(script.starts(), 1);
    assert!(!registry.get("p").await.unwrap().exited().await);

    registry.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_registrations_keep_winner_supervised() {
    let script = ConnectionScript::healthy();
    let registry = Registry::new(
        Supervisor::new(TICK),
        Arc::new(SlowProvider {
            script: script.clone(),
            calls: AtomicUsize::new(0),
        }),
        Arc::new(HostEnv::default()),
    );

    let (first, second) = tokio::join!(
        registry.register(PluginDescriptor::new("p", "/bin/p")),
        registry.register(PluginDescriptor::new("p", "/bin/p")),
    );

    let results = [first, second];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(PluginError::Conflict(id)) if id == "p")));
    assert_eq!(registry.len().await, 1);
    assert_eq!(script.starts(), 1);
    assert!(registry.is_supervising("p"));

    script.crash();
    assert!(wait_for(|| script.starts() == 2).await);
    assert!(!registry.get("p").await.unwrap().exited().await);

    registry.shutdown().await;
}

#[tokio::test]
async fn test_failed_registration_releases_id() {
    let script = ConnectionScript::healthy();
    script.set_fail_start(true);
    let registry = registry(script.clone());

    assert!(registry
        .register(PluginDescriptor::new("p", "/bin/p"))
        .await
        .is_err());

    script.set_fail_start(false);
    registry
        .register(PluginDescriptor::new("p", "/bin/p"))
        .await
        .unwrap();
    assert!(registry.is_supervising("p"));

    registry.shutdown().await;
}

#[tokio::test]
async fn test_register_without_factory_leaves_no_entry() {
    let mut provider = MockBackendFactoryProvider::new();
    provider.expect_backend_factory().returning(|_| None);
    let registry = Registry::new(
        Supervisor::new(TICK),
        Arc::new(provider),
        Arc::new(HostEnv::default()),
    );

    let err = registry
        .register(PluginDescriptor::new("p", "/bin/p"))
        .await
        .unwrap_err();

    assert!(matches!(err, PluginError::NoCompatibleImplementation(_)));
    assert!(registry.is_empty().await);
}

#[tokio::test]
async fn test_failed_start_leaves_no_entry() {
    let script = ConnectionScript::healthy();
    script.set_fail_start(true);
    let registry = registry(script.clone());

    let err = registry
        .register(PluginDescriptor::new("p", "/bin/p"))
        .await
        .unwrap_err();

    assert!(matches!(err, PluginError::HandshakeFailed(_)));
    assert!(!registry.contains("p").await);
}

#[tokio::test]
async fn test_get_unknown_plugin() {
    let registry = registry(ConnectionScript::healthy());
    assert!(matches!(
        registry.get("missing").await,
        Err(PluginError::NotRegistered(_))
    ));
}

#[tokio::test]
async fn test_get_restarts_exited_unmanaged_plugin() {
    let script = ConnectionScript::healthy();
    let registry = registry(script.clone());
    registry
        .register(PluginDescriptor::new("test-plugin", "/bin/test-plugin").unmanaged())
        .await
        .unwrap();
    assert_eq!(script.starts(), 0);

    registry.start_plugin("test-plugin").await.unwrap();
    assert_eq!(script.starts(), 1);

    script.crash();
    let plugin = registry.get("test-plugin").await.unwrap();

    assert_eq!(script.starts(), 2);
    assert!(!plugin.exited().await);
}

#[tokio::test]
async fn test_start_plugin_surfaces_error() {
    let script = ConnectionScript::healthy();
    let registry = registry(script.clone());
    registry
        .register(PluginDescriptor::new("u", "/bin/u").unmanaged())
        .await
        .unwrap();

    script.set_fail_start(true);
    assert!(matches!(
        registry.start_plugin("u").await,
        Err(PluginError::HandshakeFailed(_))
    ));
}

#[tokio::test]
async fn test_failed_lazy_restart_reports_not_registered() {
    let script = ConnectionScript::healthy();
    let registry = registry(script.clone());
    registry
        .register(PluginDescriptor::new("u", "/bin/u").unmanaged())
        .await
        .unwrap();
    registry.start_plugin("u").await.unwrap();

    script.crash();
    script.set_fail_start(true);

    assert!(matches!(
        registry.get("u").await,
        Err(PluginError::NotRegistered(_))
    ));
    // The entry survives for a later attempt.
    assert!(registry.contains("u").await);
}

#[tokio::test]
async fn test_slow_restart_does_not_block_other_plugins() {
    let slow = ConnectionScript::healthy();
    let fast = ConnectionScript::healthy();
    let mut provider = MockBackendFactoryProvider::new();
    provider.expect_backend_factory().returning({
        let (slow, fast) = (slow.clone(), fast.clone());
        move |descriptor: &PluginDescriptor| {
            let script = if descriptor.id == "slow" {
                slow.clone()
            } else {
                fast.clone()
            };
            let factory: PluginFactory =
                Arc::new(move |descriptor: PluginDescriptor, _env: EnvFn| {
                    Ok(Arc::new(script.handle(descriptor)) as Arc<dyn BackendPlugin>)
                });
            Some(factory)
        }
    });
    let registry = Arc::new(Registry::new(
        Supervisor::new(TICK),
        Arc::new(provider),
        Arc::new(HostEnv::default()),
    ));
    for id in ["slow", "fast"] {
        let descriptor = PluginDescriptor::new(id, format!("/bin/{id}")).unmanaged();
        registry.register(descriptor).await.unwrap();
        registry.start_plugin(id).await.unwrap();
    }

    slow.set_start_delay(Duration::from_millis(500));
    slow.crash();
    fast.crash();

    let stuck = tokio::spawn({
        let registry = registry.clone();
        async move { registry.get("slow").await.map(|_| ()) }
    });
    assert!(wait_for(|| slow.starts() == 2).await);

    let fast_plugin = tokio::time::timeout(Duration::from_millis(200), registry.get("fast"))
        .await
        .expect("lookup of another plugin waited on the slow restart")
        .unwrap();
    assert!(!fast_plugin.exited().await);
    assert_eq!(fast.starts(), 2);

    stuck.await.unwrap().unwrap();
    registry.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_lookups_restart_once() {
    let script = ConnectionScript::healthy();
    let registry = registry(script.clone());
    registry
        .register(PluginDescriptor::new("u", "/bin/u").unmanaged())
        .await
        .unwrap();
    registry.start_plugin("u").await.unwrap();

    script.crash();
    script.set_start_delay(Duration::from_millis(20));
    let (first, second) = tokio::join!(registry.get("u"), registry.get("u"));

    assert!(first.is_ok() && second.is_ok());
    assert_eq!(script.starts(), 2);

    registry.shutdown().await;
}

#[tokio::test]
async fn test_deregister_stops_and_removes() {
    let script = ConnectionScript::healthy();
    let registry = registry(script.clone());
    registry
        .register(PluginDescriptor::new("p", "/bin/p"))
        .await
        .unwrap();
    let plugin = registry.get("p").await.unwrap();

    registry.deregister("p").await.unwrap();

    assert!(!registry.contains("p").await);
    assert!(plugin.is_decommissioned().await);
    assert_eq!(script.kills(), 1);
    assert!(matches!(
        registry.deregister("p").await,
        Err(PluginError::NotRegistered(_))
    ));
}

#[tokio::test]
async fn test_run_shuts_down_on_cancel() {
    let script = ConnectionScript::healthy();
    let registry = Arc::new(registry(script.clone()));
    registry
        .register(PluginDescriptor::new("p", "/bin/p"))
        .await
        .unwrap();

    let token = CancellationToken::new();
    let run = tokio::spawn({
        let registry = registry.clone();
        let token = token.clone();
        async move { registry.run(token).await }
    });

    tokio::time::sleep(TICK * 2).await;
    token.cancel();

    let status = run.await.unwrap().unwrap();
    assert_eq!(status, RunStatus::Cancelled);
    assert_eq!(script.kills(), 1);
}

#[tokio::test]
async fn test_shutdown_stops_every_plugin() {
    let first = ConnectionScript::healthy();
    let second = ConnectionScript::healthy();
    let scripts = [("a", first.clone()), ("b", second.clone())];

    let mut provider = MockBackendFactoryProvider::new();
    provider
        .expect_backend_factory()
        .returning(move |descriptor| {
            let script = scripts
                .iter()
                .find(|(id, _)| *id == descriptor.id)
                .map(|(_, script)| script.clone())?;
            let factory: PluginFactory = Arc::new(move |descriptor: PluginDescriptor, _env: EnvFn| {
                Ok(Arc::new(script.handle(descriptor)) as Arc<dyn BackendPlugin>)
            });
            Some(factory)
        });
    let registry = Registry::new(
        Supervisor::new(TICK),
        Arc::new(provider),
        Arc::new(HostEnv::default()),
    );

    registry.register(PluginDescriptor::new("a", "/bin/a")).await.unwrap();
    registry.register(PluginDescriptor::new("b", "/bin/b")).await.unwrap();
    registry.shutdown().await;

    assert_eq!(first.kills(), 1);
    assert_eq!(second.kills(), 1);
}

#[tokio::test]
async fn test_env_is_recomputed_on_every_start() {
    struct CountingEnv {
        calls: StdMutex<usize>,
    }

    impl PluginEnvProvider for CountingEnv {
        fn plugin_env(&self, _descriptor: &PluginDescriptor) -> Vec<String> {
            let mut calls = self.calls.lock().unwrap();
            *calls += 1;
            vec![format!("ROTATION={}", *calls)]
        }
    }

    let seen: Arc<StdMutex<Vec<EnvFn>>> = Arc::new(StdMutex::new(Vec::new()));
    let captured = seen.clone();
    let mut provider = MockBackendFactoryProvider::new();
    provider.expect_backend_factory().returning(move |_| {
        let captured = captured.clone();
        let factory: PluginFactory = Arc::new(move |descriptor: PluginDescriptor, env: EnvFn| {
            captured.lock().unwrap().push(env);
            Ok(Arc::new(ConnectionScript::healthy().handle(descriptor)) as Arc<dyn BackendPlugin>)
        });
        Some(factory)
    });

    let registry = Registry::new(
        Supervisor::new(TICK),
        Arc::new(provider),
        Arc::new(CountingEnv {
            calls: StdMutex::new(0),
        }),
    );
    registry
        .register(PluginDescriptor::new("p", "/bin/p"))
        .await
        .unwrap();

    let env = seen.lock().unwrap()[0].clone();
    assert_eq!(env(), vec!["ROTATION=1"]);
    assert_eq!(env(), vec!["ROTATION=2"]);

    registry.shutdown().await;
}

#[test]
fn test_host_env_entries() {
    let env = HostEnv {
        host_version: "10.1.0".into(),
        license_edition: "oss".into(),
    };
    let descriptor = PluginDescriptor::new("p", "/bin/p").with_env("API_URL", "http://localhost");

    assert_eq!(
        env.plugin_env(&descriptor),
        vec![
            "PLUGIN_HOST_VERSION=10.1.0",
            "PLUGIN_LICENSE_EDITION=oss",
            "API_URL=http://localhost",
        ]
    );
}

#[tokio::test]
async fn test_default_provider_serves_core_plugins() {
    let metrics = Arc::new(PluginMetrics::new().unwrap());
    let mut core = CapabilitySet::default();
    core.insert(CapabilityObject::Data(Arc::new(FakeData::default())));
    let provider = DefaultFactoryProvider::new(HandshakeConfig::default(), TICK, metrics)
        .with_core_plugin("core", core);

    let registry = Registry::new(
        Supervisor::new(TICK),
        Arc::new(provider),
        Arc::new(HostEnv::default()),
    );
    registry
        .register(PluginDescriptor::new("core", ""))
        .await
        .unwrap();

    let plugin = registry.get("core").await.unwrap();
    assert!(plugin
        .query_data(crate::backend::QueryDataRequest::default())
        .await
        .is_ok());

    assert!(matches!(
        registry.register(PluginDescriptor::new("no-binary", "")).await,
        Err(PluginError::NoCompatibleImplementation(_))
    ));

    registry.shutdown().await;
}
