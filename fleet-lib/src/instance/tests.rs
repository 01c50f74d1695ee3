use std::sync::Arc;
use std::time::Duration;

use fleet_builder::BuildOperation;
use fleet_common::{FleetError, InstanceState, ResourceKind, WaitOptions};
use fleet_orchestrator::{Port, Probe, ProbeAction};

use crate::sidecar::Sidecar;
use crate::testing::{test_fleet, TestFleet};

async fn committed(t: &TestFleet, name: &str) -> anyhow::Result<super::Instance> {
    let instance = t.fleet.new_instance(name)?;
    instance.set_image("alpine:3.20").await?;
    instance.commit().await?;
    Ok(instance)
}

fn illegal(err: FleetError, operation: &str, state: InstanceState) {
    match err {
        FleetError::IllegalTransition {
            operation: op,
            state: s,
            ..
        } => {
            assert_eq!(op, operation);
            assert_eq!(s, state);
        }
        other => panic!("expected illegal transition, got {other}"),
    }
}

#[tokio::test]
async fn operations_outside_their_states_are_rejected() -> anyhow::Result<()> {
    let t = test_fleet()?;
    let web = t.fleet.new_instance("web")?;

    illegal(web.commit().await.unwrap_err(), "commit", InstanceState::None);
    illegal(web.start().await.unwrap_err(), "start", InstanceState::None);
    illegal(web.destroy().await.unwrap_err(), "destroy", InstanceState::None);
    illegal(web.run_command("true").await.unwrap_err(), "run_command", InstanceState::None);
    illegal(
        web.add_file_bytes(b"x".to_vec(), "/x", "0:0").await.unwrap_err(),
        "add_file",
        InstanceState::None,
    );
    assert_eq!(web.state().await, InstanceState::None);

    web.set_image("alpine:3.20").await?;
    assert_eq!(web.state().await, InstanceState::Preparing);
    illegal(
        web.set_image("busybox").await.unwrap_err(),
        "set_image",
        InstanceState::Preparing,
    );
    illegal(web.destroy().await.unwrap_err(), "destroy", InstanceState::Preparing);
    illegal(web.address().await.unwrap_err(), "address", InstanceState::Preparing);

    web.commit().await?;
    illegal(web.run_command("true").await.unwrap_err(), "run_command", InstanceState::Committed);
    illegal(
        web.execute_command(&["ls"]).await.unwrap_err(),
        "execute_command",
        InstanceState::Committed,
    );
    illegal(web.stop().await.unwrap_err(), "stop", InstanceState::Committed);
    illegal(web.logs().await.unwrap_err(), "logs", InstanceState::Committed);

    // The rejected set_image left the first source in place.
    assert_eq!(web.image().await.as_deref(), Some("alpine:3.20"));
    assert!(t.builder.builds().is_empty());
    assert!(t.client.calls().is_empty(), "nothing reached the cluster");
    Ok(())
}

#[tokio::test]
async fn build_operations_trigger_a_content_addressed_build() -> anyhow::Result<()> {
    let t = test_fleet()?;
    let app = t.fleet.new_instance("app")?;
    app.set_image("debian:12").await?;
    app.run_command("apt-get update").await?;
    app.set_env("MODE", "test").await?;
    app.add_file_bytes(b"port=80".to_vec(), "/etc/app.conf", "1000:1000")
        .await?;
    app.set_user("1000").await?;
    app.commit().await?;

    let builds = t.builder.builds();
    assert_eq!(builds.len(), 1);
    let (plan, reference) = &builds[0];
    assert_eq!(plan.operations.len(), 4);
    assert!(matches!(&plan.operations[1], BuildOperation::Env { key, .. } if key == "MODE"));
    assert!(reference.starts_with("ttl.sh/"));
    assert!(reference.ends_with(":24h"));
    assert_eq!(app.image().await.as_deref(), Some(reference.as_str()));
    Ok(())
}

#[tokio::test]
async fn failed_build_keeps_preparing() -> anyhow::Result<()> {
    let t = test_fleet()?;
    t.builder.fail_builds("no space left on device");
    let app = t.fleet.new_instance("app")?;
    app.set_image("debian:12").await?;
    app.run_command("make").await?;

    let err = app.commit().await.unwrap_err();
    assert!(matches!(err, FleetError::Build { log: Some(_), .. }));
    assert_eq!(app.state().await, InstanceState::Preparing);
    Ok(())
}

#[tokio::test]
async fn env_is_runtime_after_commit() -> anyhow::Result<()> {
    let t = test_fleet()?;
    let app = committed(&t, "app").await?;
    app.set_env("LOG_LEVEL", "debug").await?;
    app.add_file_bytes(b"a=1".to_vec(), "/etc/a.conf", "0:0").await?;

    assert!(t.builder.builds().is_empty(), "bare image is used as-is");
    let spec = app.own_spec().await;
    assert_eq!(spec.env.get("LOG_LEVEL").map(String::as_str), Some("debug"));
    assert_eq!(spec.files.len(), 1);
    assert_eq!(app.read_file("/etc/a.conf").await?, b"a=1");
    Ok(())
}

#[tokio::test]
async fn address_before_start_creates_the_endpoint() -> anyhow::Result<()> {
    let t = test_fleet()?;
    let web = t.fleet.new_instance("web")?;
    web.set_image("nginx:1.27").await?;
    web.add_port_tcp(80).await?;
    web.commit().await?;

    let address = web.address().await?;
    assert_eq!(address, "10.96.0.1");
    assert!(t.client.contains(ResourceKind::Service, web.generated_name()));

    web.start().await?;
    assert_eq!(web.address().await?, address, "the endpoint is kept across start");
    assert_eq!(t.client.names(ResourceKind::Service).len(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn start_times_out_when_compute_never_runs() -> anyhow::Result<()> {
    let t = test_fleet()?;
    t.client.set_pods_running(false);
    let web = committed(&t, "web").await?;

    let began = tokio::time::Instant::now();
    let err = web
        .start_with(&WaitOptions::new(Duration::from_secs(60)))
        .await
        .unwrap_err();
    let elapsed = began.elapsed();

    assert!(err.is_timeout(), "{err}");
    assert!(elapsed >= Duration::from_secs(60));
    assert!(elapsed < Duration::from_secs(62));
    assert_eq!(web.state().await, InstanceState::Committed);
    Ok(())
}

#[tokio::test]
async fn cancelled_start_is_distinct() -> anyhow::Result<()> {
    let t = test_fleet()?;
    t.client.set_pods_running(false);
    let web = committed(&t, "web").await?;
    let opts = WaitOptions::new(Duration::from_secs(600));
    opts.cancel.cancel();

    let err = web.start_with(&opts).await.unwrap_err();
    assert!(err.is_cancelled(), "{err}");
    Ok(())
}

#[tokio::test]
async fn concurrent_starts_resolve_to_one_success() -> anyhow::Result<()> {
    let t = test_fleet()?;
    let web = committed(&t, "web").await?;

    let (a, b) = tokio::join!(web.start(), web.start());
    let failures: Vec<FleetError> = [a, b].into_iter().filter_map(Result::err).collect();
    assert_eq!(failures.len(), 1);
    assert!(failures[0].is_illegal_transition());
    assert_eq!(web.state().await, InstanceState::Started);
    Ok(())
}

#[tokio::test]
async fn destroy_is_idempotent() -> anyhow::Result<()> {
    let t = test_fleet()?;
    let web = committed(&t, "web").await?;
    web.add_volume("/data", "1Gi").await?;
    web.start().await?;

    web.destroy().await?;
    let calls = t.client.calls().len();
    web.destroy().await?;
    assert_eq!(t.client.calls().len(), calls, "second destroy is a no-op");
    assert_eq!(web.state().await, InstanceState::Destroyed);
    assert!(t.client.names(ResourceKind::PersistentVolumeClaim).is_empty());
    assert!(t.client.names(ResourceKind::Pod).is_empty());
    Ok(())
}

#[tokio::test]
async fn destroy_from_committed_tolerates_absent_resources() -> anyhow::Result<()> {
    let t = test_fleet()?;
    let web = committed(&t, "web").await?;
    web.destroy().await?;
    assert_eq!(web.state().await, InstanceState::Destroyed);
    Ok(())
}

#[tokio::test]
async fn failed_teardown_keeps_state_for_retry() -> anyhow::Result<()> {
    let t = test_fleet()?;
    let web = committed(&t, "web").await?;
    web.add_port_tcp(80).await?;
    web.start().await?;
    t.client
        .fail_on("delete", ResourceKind::Service, web.generated_name(), "forbidden");

    let err = web.destroy().await.unwrap_err();
    assert!(matches!(err, FleetError::Teardown { .. }));
    assert_eq!(web.state().await, InstanceState::Started);
    Ok(())
}

#[tokio::test]
async fn stop_keeps_volumes_and_restart_redeploys_compute() -> anyhow::Result<()> {
    let t = test_fleet()?;
    let db = committed(&t, "db").await?;
    db.add_volume_with_owner("/var/lib/db", "2Gi", 999).await?;
    db.start().await?;

    db.stop().await?;
    assert_eq!(db.state().await, InstanceState::Stopped);
    assert!(t.client.names(ResourceKind::Pod).is_empty());
    assert_eq!(t.client.names(ResourceKind::PersistentVolumeClaim).len(), 1);
    db.wait_stopped(&WaitOptions::new(Duration::from_secs(5))).await?;

    let before = t.client.calls().len();
    db.start().await?;
    let restart: Vec<String> = t.client.calls()[before..].to_vec();
    assert!(restart
        .iter()
        .all(|c| !c.contains("PersistentVolumeClaim")), "{restart:?}");
    assert_eq!(db.state().await, InstanceState::Started);
    db.wait_running(&WaitOptions::new(Duration::from_secs(5))).await?;
    Ok(())
}

#[tokio::test]
async fn interrupted_stop_still_leaves_the_instance_stopped() -> anyhow::Result<()> {
    let t = test_fleet()?;
    let web = committed(&t, "web").await?;
    web.start().await?;

    let opts = WaitOptions::new(Duration::from_secs(600));
    opts.cancel.cancel();
    let err = web.stop_with(&opts).await.unwrap_err();
    assert!(err.is_cancelled(), "{err}");
    assert_eq!(web.state().await, InstanceState::Stopped);
    assert!(!t.client.contains(ResourceKind::ReplicaSet, web.generated_name()));

    web.wait_stopped(&WaitOptions::new(Duration::from_secs(5))).await?;
    web.start().await?;
    assert_eq!(web.state().await, InstanceState::Started);
    assert_eq!(t.client.names(ResourceKind::Pod).len(), 1);
    Ok(())
}

#[tokio::test]
async fn image_swap_rolls_the_pod() -> anyhow::Result<()> {
    let t = test_fleet()?;
    let web = committed(&t, "web").await?;
    web.start().await?;
    let before = t.client.names(ResourceKind::Pod);

    web.set_image("alpine:3.21").await?;
    let after = t.client.names(ResourceKind::Pod);
    assert_eq!(after.len(), 1);
    assert_ne!(before, after);
    assert_eq!(web.image().await.as_deref(), Some("alpine:3.21"));

    let rs = t
        .client
        .object(ResourceKind::ReplicaSet, web.generated_name())
        .and_then(|m| m.into_replica_set())
        .and_then(|rs| rs.spec)
        .and_then(|spec| spec.template)
        .and_then(|tpl| tpl.spec)
        .map(|pod| pod.containers[0].image.clone());
    assert_eq!(rs, Some(Some("alpine:3.21".to_string())));
    Ok(())
}

#[tokio::test]
async fn runtime_access_in_started() -> anyhow::Result<()> {
    let t = test_fleet()?;
    let web = committed(&t, "web").await?;
    web.start().await?;
    let pod = t.client.names(ResourceKind::Pod).remove(0);

    t.client.set_exec_output("cat /etc/hostname", "web-1\n");
    assert_eq!(web.read_file("/etc/hostname").await?, b"web-1\n");

    t.client.set_exec_output("uname -s", "Linux\n");
    assert_eq!(web.execute_command(&["uname", "-s"]).await?, "Linux\n");

    t.client.set_logs(&pod, web.generated_name(), "listening on :80\n");
    assert_eq!(web.logs().await?, "listening on :80\n");

    let calls = t.client.exec_calls();
    assert!(calls.iter().all(|(p, c, _)| p == &pod && c == web.generated_name()));
    Ok(())
}

#[tokio::test]
async fn read_file_in_started_keeps_binary_content() -> anyhow::Result<()> {
    let t = test_fleet()?;
    let web = committed(&t, "web").await?;
    web.start().await?;

    let blob = [0xff, 0x00, 0xfe, 0x80, b'\n'];
    t.client.set_exec_bytes("cat /bin/blob", &blob);
    assert_eq!(web.read_file("/bin/blob").await?, blob);

    // Text output is decoded lossily instead of failing.
    t.client.set_exec_bytes("head -c 2 /bin/blob", &blob[..2]);
    assert_eq!(web.execute_command(&["head", "-c", "2", "/bin/blob"]).await?, "\u{fffd}\0");
    Ok(())
}

#[tokio::test]
async fn read_file_from_build_layer_and_image() -> anyhow::Result<()> {
    let t = test_fleet()?;
    let app = t.fleet.new_instance("app")?;
    app.set_image("debian:12").await?;
    t.builder.set_image_file("debian:12", "/etc/os-release", b"ID=debian");
    app.add_file_bytes(b"v1".to_vec(), "/app/version", "0:0").await?;
    app.add_file_bytes(b"v2".to_vec(), "/app/version", "0:0").await?;

    assert_eq!(app.read_file("/app/version").await?, b"v2", "latest staged file wins");
    assert_eq!(app.read_file("/etc/os-release").await?, b"ID=debian");

    app.commit().await?;
    let image = app.image().await.unwrap_or_default();
    t.builder.set_image_file(&image, "/app/version", b"v2");
    assert_eq!(app.read_file("/app/version").await?, b"v2");
    Ok(())
}

#[tokio::test]
async fn network_toggle() -> anyhow::Result<()> {
    let t = test_fleet()?;
    let web = committed(&t, "web").await?;
    web.start().await?;

    web.disable_network().await?;
    assert!(web.network_disabled().await?);
    web.enable_network().await?;
    assert!(!web.network_disabled().await?);
    Ok(())
}

#[tokio::test]
async fn clone_is_independent() -> anyhow::Result<()> {
    let t = test_fleet()?;
    let template = committed(&t, "node").await?;
    template.add_port_tcp(26656).await?;
    template
        .set_readiness_probe(Probe::new(ProbeAction::Tcp { port: 26656 }))
        .await?;

    let copy = template.clone_with_suffix("-b").await?;
    assert_eq!(copy.name(), "node-b");
    assert_ne!(copy.generated_name(), template.generated_name());
    assert_eq!(copy.state().await, InstanceState::Committed);

    copy.add_port_udp(53).await?;
    assert_eq!(template.own_spec().await.ports, vec![Port::tcp(26656)]);
    assert_eq!(copy.own_spec().await.ports, vec![Port::tcp(26656), Port::udp(53)]);
    assert!(copy.own_spec().await.probes.readiness.is_some());

    template.start().await?;
    illegal(
        template.clone_with_name("late").await.unwrap_err(),
        "clone",
        InstanceState::Started,
    );
    Ok(())
}

#[tokio::test]
async fn pool_destroys_its_template() -> anyhow::Result<()> {
    let t = test_fleet()?;
    let template = committed(&t, "val").await?;
    let pool = template.create_pool(3).await?;

    assert_eq!(template.state().await, InstanceState::Destroyed);
    assert_eq!(pool.len(), 3);
    let names: Vec<&str> = pool.instances().iter().map(|i| i.name()).collect();
    assert_eq!(names, vec!["val-0", "val-1", "val-2"]);
    let mut generated: Vec<&str> = pool.instances().iter().map(|i| i.generated_name()).collect();
    generated.sort();
    generated.dedup();
    assert_eq!(generated.len(), 3);

    pool.start_all().await?;
    pool.wait_all_running(&WaitOptions::new(Duration::from_secs(5)))
        .await?;
    assert_eq!(t.client.names(ResourceKind::Pod).len(), 3);
    pool.destroy().await?;
    assert!(t.client.names(ResourceKind::ReplicaSet).is_empty());
    Ok(())
}

#[tokio::test]
async fn batch_destroy_attempts_everything() -> anyhow::Result<()> {
    let t = test_fleet()?;
    let a = committed(&t, "a").await?;
    let b = committed(&t, "b").await?;
    a.start().await?;
    b.start().await?;
    t.client
        .fail_on("delete", ResourceKind::ReplicaSet, a.generated_name(), "etcd unavailable");

    let err = crate::destroy_all(&[&a, &b]).await.unwrap_err();
    match err {
        FleetError::Batch(errors) => {
            assert_eq!(errors.len(), 1);
            assert!(errors[0].to_string().contains("etcd unavailable"));
        }
        other => panic!("expected batch error, got {other}"),
    }
    assert_eq!(b.state().await, InstanceState::Destroyed);
    assert_eq!(a.state().await, InstanceState::Started);
    Ok(())
}

#[tokio::test]
async fn sidecar_attachment_rules() -> anyhow::Result<()> {
    let t = test_fleet()?;
    let parent = committed(&t, "app").await?;
    let other = committed(&t, "other").await?;

    let uncommitted = Arc::new(t.fleet.new_instance("log-agent")?);
    uncommitted.set_image("fluent-bit:3").await?;
    illegal(
        parent.add_sidecar(uncommitted.clone()).await.unwrap_err(),
        "attach",
        InstanceState::Preparing,
    );
    uncommitted.commit().await?;
    parent.add_sidecar(uncommitted.clone()).await?;
    assert_eq!(uncommitted.parent().await.as_deref(), Some(parent.generated_name()));

    let twice = other.add_sidecar(uncommitted.clone()).await.unwrap_err();
    assert!(matches!(twice, FleetError::InvalidArgument(_)), "{twice}");

    let owner = Arc::new(committed(&t, "owner").await?);
    owner.add_sidecar(Arc::new(committed(&t, "inner").await?)).await?;
    let nested = other.add_sidecar(owner.clone()).await.unwrap_err();
    assert!(matches!(nested, FleetError::InvalidArgument(_)), "{nested}");

    other.start().await?;
    let late = Arc::new(committed(&t, "late").await?);
    illegal(
        other.add_sidecar(late).await.unwrap_err(),
        "add_sidecar",
        InstanceState::Started,
    );
    Ok(())
}

#[tokio::test]
async fn instances_adding_each_other_do_not_deadlock() -> anyhow::Result<()> {
    let t = test_fleet()?;
    let a = Arc::new(committed(&t, "a").await?);
    let b = Arc::new(committed(&t, "b").await?);

    let (ab, ba) = tokio::time::timeout(
        Duration::from_secs(5),
        async { tokio::join!(a.add_sidecar(b.clone()), b.add_sidecar(a.clone())) },
    )
    .await?;
    let attached = [ab.is_ok(), ba.is_ok()];
    assert_eq!(attached.iter().filter(|ok| **ok).count(), 1, "{attached:?}");

    let (parent, child) = if attached[0] { (&a, &b) } else { (&b, &a) };
    assert_eq!(child.parent().await.as_deref(), Some(parent.generated_name()));
    assert!(parent.parent().await.is_none());
    assert_eq!(parent.sidecars().await.len(), 1);
    assert!(child.sidecars().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn sidecar_follows_parent_and_shares_the_pod() -> anyhow::Result<()> {
    let t = test_fleet()?;
    let parent = committed(&t, "app").await?;
    parent.add_port_tcp(8080).await?;
    let agent = Arc::new(committed(&t, "agent").await?);
    agent.add_port_tcp(24224).await?;
    agent.add_volume("/buffer", "512Mi").await?;
    parent.add_sidecar(agent.clone()).await?;

    parent.start().await?;
    assert_eq!(agent.state().await, InstanceState::Started);
    illegal(
        agent.start().await.unwrap_err(),
        "start",
        InstanceState::Started,
    );

    let pod = t
        .client
        .object(ResourceKind::ReplicaSet, parent.generated_name())
        .and_then(|m| m.into_replica_set())
        .and_then(|rs| rs.spec)
        .and_then(|spec| spec.template)
        .and_then(|tpl| tpl.spec)
        .ok_or_else(|| anyhow::anyhow!("no pod template"))?;
    let containers: Vec<&str> = pod.containers.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(containers, vec![parent.generated_name(), agent.generated_name()]);
    assert!(t.client.contains(
        ResourceKind::PersistentVolumeClaim,
        &format!("{}-data", agent.generated_name())
    ));

    t.client.set_exec_output("ls /buffer", "chunk-1\n");
    assert_eq!(agent.execute_command(&["ls", "/buffer"]).await?, "chunk-1\n");
    let (_, container, _) = t.client.exec_calls().remove(0);
    assert_eq!(container, agent.generated_name());

    parent.stop().await?;
    assert_eq!(agent.state().await, InstanceState::Stopped);
    parent.destroy().await?;
    assert_eq!(agent.state().await, InstanceState::Destroyed);
    assert!(t.client.names(ResourceKind::PersistentVolumeClaim).is_empty());
    Ok(())
}

#[tokio::test]
async fn attached_sidecar_is_driven_by_its_parent() -> anyhow::Result<()> {
    let t = test_fleet()?;
    let parent = committed(&t, "app").await?;
    let agent = Arc::new(committed(&t, "agent").await?);
    parent.add_sidecar(agent.clone()).await?;

    let err = agent.start().await.unwrap_err();
    assert!(matches!(err, FleetError::InvalidArgument(_)), "{err}");
    let err = agent.clone_with_name("copy").await.unwrap_err();
    assert!(matches!(err, FleetError::InvalidArgument(_)), "{err}");
    Ok(())
}

#[tokio::test]
async fn clone_copies_sidecars_with_fresh_names() -> anyhow::Result<()> {
    let t = test_fleet()?;
    let parent = committed(&t, "app").await?;
    let agent = Arc::new(committed(&t, "agent").await?);
    parent.add_sidecar(agent.clone()).await?;

    let copy = parent.clone_with_name("app-2").await?;
    let sidecars = copy.sidecars().await;
    assert_eq!(sidecars.len(), 1);
    let cloned = sidecars[0].instance();
    assert_eq!(cloned.name(), "agent");
    assert_ne!(cloned.generated_name(), agent.generated_name());
    assert_eq!(cloned.parent().await.as_deref(), Some(copy.generated_name()));
    assert_eq!(agent.parent().await.as_deref(), Some(parent.generated_name()));
    Ok(())
}

#[tokio::test]
async fn declarations_are_validated() -> anyhow::Result<()> {
    let t = test_fleet()?;
    let web = t.fleet.new_instance("web")?;
    assert!(t.fleet.new_instance("  ").is_err());
    assert!(web.add_port_tcp(0).await.is_err());
    web.add_port_tcp(80).await?;
    assert!(web.add_port_tcp(80).await.is_err());
    assert!(web.add_volume("data", "1Gi").await.is_err());
    assert!(web.add_volume("/data", "lots").await.is_err());
    assert!(web
        .add_volume("/data", "340282366920938463463374607431768211455Ki")
        .await
        .is_err());
    assert!(web.set_cpu("fast").await.is_err());
    web.set_cpu("500m").await?;
    web.set_memory("128Mi", "256Mi").await?;
    assert!(web.set_directory("/definitely/not/here").await.is_err());
    assert_eq!(web.state().await, InstanceState::None);

    let spec = web.own_spec().await;
    assert_eq!(spec.resources.cpu_request.as_deref(), Some("500m"));
    assert_eq!(spec.resources.memory_limit.as_deref(), Some("256Mi"));
    Ok(())
}
