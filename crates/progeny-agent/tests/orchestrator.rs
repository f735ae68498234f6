use std::{sync::Arc, time::Duration};

use futures_util::future::join_all;

use progeny_agent::Error;
use progeny_agent::Progeny;
use progeny_agent::port_alloc::{PortManager, PortRange};
use progeny_agent::process_manager::{ProcessRegistry, RegistryOptions, TeardownPolicy};
use progeny_agent::recipes::Capabilities;
use progeny_agent::spinner::LaunchSettings;
use progeny_agent::templates::{CommandBuilder, CommandSpec, LaunchSpec};
use progeny_process::Selector;

fn launcher(script: &str) -> Vec<String> {
    ["sh", "-c", script, "worker"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

async fn progeny(range: (i64, i64), script: &str, ready_timeout: Option<Duration>) -> Progeny {
    let db = progeny_db::connect("sqlite::memory:").await.unwrap();
    let ports = PortManager::new(PortRange::new(range.0, range.1).unwrap());
    let registry = ProcessRegistry::open(
        db,
        ports,
        RegistryOptions {
            terminate_grace: Duration::from_millis(100),
            ..RegistryOptions::default()
        },
    )
    .await
    .unwrap();
    let settings = LaunchSettings {
        launcher: launcher(script),
        session_env_var: "PRODIGY_ALLOWED_SESSIONS".to_string(),
        config_env_var: "PRODIGY_CONFIG_OVERRIDES".to_string(),
        startup_check: Duration::from_millis(100),
        ready_timeout,
        worker_timeout: None,
        uniquify_sessions: false,
    };
    Progeny::new(
        CommandBuilder::default(),
        registry,
        Capabilities::from_names(["echo"]),
        settings,
    )
}

fn echo_ds() -> LaunchSpec {
    CommandSpec::recipe("echo", ["ds"]).into()
}

#[tokio::test]
async fn spin_rejects_duplicates_until_swept() {
    let p = progeny((47_100, 47_110), "sleep 30", None).await;

    let (port, session) = p.spin("alice", &echo_ds(), Some(true)).await.unwrap();
    assert!((47_100..47_110).contains(&port));
    assert!(session.starts_with("alice-"));

    let err = p.spin("alice", &echo_ds(), None).await.unwrap_err();
    assert!(matches!(err, Error::DuplicateSession(ref id) if id == "alice"));

    let records = p.registry().records().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].port, port);
    assert_eq!(records[0].session_name, session);

    let swept = p
        .registry()
        .sweep(&Selector::identifier("alice"), true)
        .await
        .unwrap();
    assert_eq!(swept, 1);

    let (port, session) = p.spin("alice", &echo_ds(), None).await.unwrap();
    assert!((47_100..47_110).contains(&port));
    assert_eq!(session, "alice");

    p.shutdown().await.unwrap();
}

#[tokio::test]
async fn distinct_identifiers_get_distinct_ports() {
    let p = progeny((47_120, 47_130), "sleep 30", None).await;
    let (a, _) = p.spin("alice", &echo_ds(), None).await.unwrap();
    let (b, _) = p.spin("bob", &echo_ds(), None).await.unwrap();
    assert_ne!(a, b);

    let report = p.shutdown().await.unwrap();
    assert_eq!(report.swept, 2);
    // The table is dropped on teardown by default.
    assert!(p.registry().records().await.is_err());
}

#[tokio::test]
async fn worker_that_exits_releases_its_port() {
    let p = progeny((47_140, 47_150), "exit 3", None).await;
    let before = p.registry().available_ports().await;

    let err = p.spin("alice", &echo_ds(), None).await.unwrap_err();
    assert!(matches!(err, Error::WorkerExited { .. }));

    assert_eq!(p.registry().available_ports().await, before);
    assert!(!p.registry().already_has_instance("alice").await.unwrap());
    assert!(p.registry().records().await.unwrap().is_empty());
}

#[tokio::test]
async fn worker_that_never_binds_is_not_registered() {
    let p = progeny(
        (47_160, 47_170),
        "sleep 30",
        Some(Duration::from_millis(300)),
    )
    .await;

    let err = p.spin("alice", &echo_ds(), None).await.unwrap_err();
    assert!(matches!(err, Error::WorkerNotReady { .. }));
    assert!(p.registry().records().await.unwrap().is_empty());
    assert!(!p.registry().already_has_instance("alice").await.unwrap());
}

#[tokio::test]
async fn ambiguous_request_fails_before_allocating() {
    let p = progeny((47_180, 47_190), "sleep 30", None).await;
    let mut launch = echo_ds();
    launch.spec.command = Some("echo ds".to_string());

    let err = p.spin("alice", &launch, None).await.unwrap_err();
    assert!(matches!(err, Error::AmbiguousSpec(_)));
    assert!(!p.registry().already_has_instance("alice").await.unwrap());
}

#[tokio::test]
async fn retained_registry_survives_teardown() {
    let db = progeny_db::connect("sqlite::memory:").await.unwrap();
    let ports = PortManager::new(PortRange::new(47_200, 47_210).unwrap());
    let registry = ProcessRegistry::open(
        db,
        ports,
        RegistryOptions {
            terminate_grace: Duration::from_millis(100),
            teardown: TeardownPolicy::Retain,
            ..RegistryOptions::default()
        },
    )
    .await
    .unwrap();

    assert_eq!(registry.teardown().await.unwrap(), 0);
    assert!(registry.records().await.unwrap().is_empty());
}

#[tokio::test]
async fn identifier_that_is_not_a_session_name_is_refused() {
    let p = progeny((47_220, 47_230), "sleep 30", None).await;
    let before = p.registry().available_ports().await;

    let too_long = "x".repeat(300);
    for id in ["Alice Smith", "a;b", "", too_long.as_str()] {
        let err = p.spin(id, &echo_ds(), None).await.unwrap_err();
        assert!(matches!(err, Error::InvalidIdentifier(_)), "{id:?}");
        assert!(!p.registry().already_has_instance(id).await.unwrap());
    }
    // Fits alone, but not once the random suffix is appended.
    let long = "x".repeat(250);
    assert!(matches!(
        p.spin(&long, &echo_ds(), Some(true)).await,
        Err(Error::InvalidIdentifier(_))
    ));

    assert_eq!(p.registry().available_ports().await, before);
    assert!(p.registry().records().await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_spins_get_distinct_ports() {
    let p = Arc::new(progeny((47_300, 47_306), "sleep 30", None).await);

    let results = join_all((0..5).map(|i| {
        let p = p.clone();
        tokio::spawn(async move { p.spin(&format!("user{i}"), &echo_ds(), None).await })
    }))
    .await;

    let mut ports: Vec<u16> = results
        .into_iter()
        .map(|r| r.unwrap().unwrap().0)
        .collect();
    ports.sort_unstable();
    ports.dedup();
    assert_eq!(ports.len(), 5);
    assert!(ports.iter().all(|p| (47_300..47_306).contains(p)));
    assert_eq!(p.registry().records().await.unwrap().len(), 5);

    assert_eq!(p.shutdown().await.unwrap().swept, 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_spins_of_one_identifier_start_one_worker() {
    let p = Arc::new(progeny((47_320, 47_330), "sleep 30", None).await);

    let results = join_all((0..4).map(|_| {
        let p = p.clone();
        tokio::spawn(async move { p.spin("carol", &echo_ds(), None).await })
    }))
    .await;
    let results: Vec<_> = results.into_iter().map(|r| r.unwrap()).collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(
        results
            .iter()
            .filter(|r| matches!(r, Err(Error::DuplicateSession(id)) if id == "carol"))
            .count(),
        3
    );
    assert_eq!(p.registry().records().await.unwrap().len(), 1);

    assert_eq!(p.shutdown().await.unwrap().swept, 1);
}
