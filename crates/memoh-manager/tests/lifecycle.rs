//! End-to-end lifecycle against the in-memory runtime and catalogue.

use std::sync::Arc;
use std::time::Duration;

use memoh_manager::{ExecRequest, Manager, ManagerConfig};
use memoh_runtime::{MockRuntime, RuntimeService};
use memoh_store::{Catalogue, MemoryCatalogue};

fn manager_with(
    runtime: Arc<MockRuntime>,
    catalogue: Arc<MemoryCatalogue>,
) -> Manager {
    Manager::new(
        runtime,
        catalogue,
        ManagerConfig {
            image: "docker.io/library/alpine:latest".to_string(),
            data_mount: "/data".to_string(),
            host_path_root: String::new(),
            namespace: "memoh".to_string(),
            snapshotter: "overlayfs".to_string(),
        },
    )
}

#[tokio::test]
async fn full_user_lifecycle() {
    let runtime = Arc::new(MockRuntime::new());
    let catalogue = Arc::new(MemoryCatalogue::new());
    let manager = manager_with(runtime.clone(), catalogue.clone());

    manager.init().await.unwrap();
    manager.ensure_user("alice").await.unwrap();
    manager.start("alice").await.unwrap();

    let result = manager
        .exec(ExecRequest {
            user_id: "alice".to_string(),
            command: vec!["sh".to_string(), "-c".to_string(), "echo hi".to_string()],
            use_stdio: true,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(result.exit_code, 0);

    let v1 = manager.create_version("alice").await.unwrap();
    let v2 = manager.create_version("alice").await.unwrap();
    assert_eq!((v1.version, v2.version), (1, 2));

    manager.rollback("alice", 1).await.unwrap();
    assert_eq!(
        runtime.snapshot_parent("memoh-user-alice").await.unwrap(),
        "memoh-user-alice:v1"
    );
    // Rollback does not delete intermediate versions.
    assert_eq!(manager.list_versions("alice").await.unwrap().len(), 2);

    // The container can start again after rollback.
    manager.start("alice").await.unwrap();
    manager.stop("alice", Duration::from_secs(5)).await.unwrap();

    // The caller's deadline reaches the runtime.
    let stops = runtime.stop_requests().await;
    assert_eq!(stops.last().unwrap().timeout, Duration::from_secs(5));

    let events: Vec<String> = catalogue
        .list_events("memoh-user-alice")
        .await
        .unwrap()
        .iter()
        .map(|e| e.event_type.clone())
        .collect();
    assert_eq!(
        events,
        vec![
            "created",
            "started",
            "version_created",
            "version_created",
            "rolled_back",
            "started",
            "stopped",
        ]
    );

    manager.delete("alice").await.unwrap();
    assert!(runtime
        .get_container("memoh-user-alice")
        .await
        .unwrap_err()
        .is_not_found());
    assert!(catalogue
        .get_container("memoh-user-alice")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn operations_on_different_users_are_independent() {
    let runtime = Arc::new(MockRuntime::new());
    let catalogue = Arc::new(MemoryCatalogue::new());
    let manager = Arc::new(manager_with(runtime.clone(), catalogue));

    let mut handles = Vec::new();
    for user in ["alice", "bob", "carol"] {
        let manager = manager.clone();
        handles.push(tokio::spawn(async move {
            manager.ensure_user(user).await.unwrap();
            manager.start(user).await.unwrap();
            manager.create_version(user).await.unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(
        manager.list_users().await.unwrap(),
        vec!["alice", "bob", "carol"]
    );
    for user in ["alice", "bob", "carol"] {
        let versions = manager.list_versions(user).await.unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].version, 1);
    }
}
