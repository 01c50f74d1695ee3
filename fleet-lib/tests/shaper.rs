use std::sync::Arc;
use std::time::Duration;

use fleet_common::ResourceKind;
use mockito::{Matcher, Mock, ServerGuard};
use serde_json::json;
use testfleet::testing::{test_fleet_with_endpoint, TestFleet};
use testfleet::{Fault, FleetError, InstanceState, NetworkShaper, Sidecar, WaitOptions};

async fn benign_stop(server: &mut ServerGuard, service: &str, slug: &str) -> Mock {
    server
        .mock("POST", format!("/api/v1/services/{service}/stop").as_str())
        .with_status(400)
        .with_body(json!({"slug": slug, "title": "Bad request", "message": slug}).to_string())
        .expect_at_least(1)
        .create_async()
        .await
}

async fn ok_stop(server: &mut ServerGuard, service: &str) -> Mock {
    server
        .mock("POST", format!("/api/v1/services/{service}/stop").as_str())
        .with_status(200)
        .expect_at_least(1)
        .create_async()
        .await
}

async fn start(server: &mut ServerGuard, service: &str, params: serde_json::Value, hits: usize) -> Mock {
    server
        .mock("POST", format!("/api/v1/services/{service}/start").as_str())
        .match_body(Matcher::Json(params))
        .with_status(200)
        .expect(hits)
        .create_async()
        .await
}

/// A started "web" instance with a shaper pointed at `server`.
async fn shaped_web(server: &ServerGuard) -> anyhow::Result<(TestFleet, testfleet::Instance, Arc<NetworkShaper>)> {
    let t = test_fleet_with_endpoint(&server.url())?;
    let web = t.fleet.new_instance("web")?;
    web.set_image("nginx:1.27").await?;
    web.add_port_tcp(80).await?;
    web.commit().await?;
    let shaper = web.enable_network_shaper().await?;
    web.start().await?;
    Ok((t, web, shaper))
}

#[tokio::test]
async fn switching_bandwidth_to_packet_loss_tolerates_idle_services() -> anyhow::Result<()> {
    let mut server = mockito::Server::new_async().await;
    let _bandwidth_stop = ok_stop(&mut server, "bandwidth").await;
    let _latency_stop = benign_stop(&mut server, "latency", "service-not-initialized").await;
    let _loss_stop = benign_stop(&mut server, "packetloss", "service-not-started").await;
    let bandwidth = start(
        &mut server,
        "bandwidth",
        json!({"network_interface_name": "eth0", "limit": 1_000_000}),
        1,
    )
    .await;
    let loss = start(
        &mut server,
        "packetloss",
        json!({"network_interface_name": "eth0", "packet_loss_rate": 10}),
        1,
    )
    .await;

    let (_t, _web, shaper) = shaped_web(&server).await?;
    shaper.set_bandwidth_limit(1_000_000).await?;
    shaper.set_packet_loss(10).await?;

    bandwidth.assert_async().await;
    loss.assert_async().await;
    assert_eq!(shaper.active_fault().await, Some(Fault::PacketLoss { rate: 10 }));
    Ok(())
}

#[tokio::test]
async fn repeated_bandwidth_limits_replace_each_other() -> anyhow::Result<()> {
    let mut server = mockito::Server::new_async().await;
    let _bandwidth_stop = ok_stop(&mut server, "bandwidth").await;
    let _latency_stop = benign_stop(&mut server, "latency", "service-not-ready").await;
    let _loss_stop = benign_stop(&mut server, "packetloss", "service-not-started").await;
    let first = start(
        &mut server,
        "bandwidth",
        json!({"network_interface_name": "eth0", "limit": 1000}),
        1,
    )
    .await;
    let second = start(
        &mut server,
        "bandwidth",
        json!({"network_interface_name": "eth0", "limit": 5000}),
        1,
    )
    .await;

    let (_t, _web, shaper) = shaped_web(&server).await?;
    shaper.set_bandwidth_limit(1000).await?;
    shaper.set_bandwidth_limit(5000).await?;

    first.assert_async().await;
    second.assert_async().await;
    assert_eq!(shaper.active_fault().await, Some(Fault::Bandwidth { limit: 5000 }));
    Ok(())
}

#[tokio::test]
async fn zero_only_stops_and_clear_leaves_nothing_active() -> anyhow::Result<()> {
    let mut server = mockito::Server::new_async().await;
    let _bandwidth_stop = ok_stop(&mut server, "bandwidth").await;
    let _latency_stop = ok_stop(&mut server, "latency").await;
    let _loss_stop = ok_stop(&mut server, "packetloss").await;
    let latency = start(
        &mut server,
        "latency",
        json!({"network_interface_name": "eth0", "latency": 200, "jitter": 20}),
        1,
    )
    .await;
    let never = server
        .mock("POST", Matcher::Regex(r"^/api/v1/services/(bandwidth|packetloss)/start$".to_string()))
        .expect(0)
        .create_async()
        .await;

    let (_t, _web, shaper) = shaped_web(&server).await?;
    shaper.set_latency_and_jitter(200, 20).await?;
    assert!(shaper.active_fault().await.is_some());
    shaper.set_bandwidth_limit(0).await?;
    assert_eq!(shaper.active_fault().await, None);
    shaper.set_packet_loss(0).await?;
    shaper.clear_faults().await?;
    assert_eq!(shaper.active_fault().await, None);

    latency.assert_async().await;
    never.assert_async().await;
    Ok(())
}

#[tokio::test]
async fn other_stop_failures_surface() -> anyhow::Result<()> {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/api/v1/services/bandwidth/stop")
        .with_status(500)
        .with_body(json!({"slug": "internal-error", "message": "RTNETLINK answers: Operation not permitted"}).to_string())
        .create_async()
        .await;

    let (_t, _web, shaper) = shaped_web(&server).await?;
    let err = shaper.set_latency_and_jitter(50, 5).await.unwrap_err();
    match err {
        FleetError::Shaper { message, .. } => assert!(message.contains("Operation not permitted")),
        other => panic!("expected shaper error, got {other}"),
    }
    Ok(())
}

#[tokio::test]
async fn faults_need_a_started_parent() -> anyhow::Result<()> {
    let server = mockito::Server::new_async().await;
    let t = test_fleet_with_endpoint(&server.url())?;
    let web = t.fleet.new_instance("web")?;
    web.set_image("nginx:1.27").await?;
    web.commit().await?;
    let shaper = web.enable_network_shaper().await?;

    assert_eq!(shaper.instance().state().await, InstanceState::Committed);
    let err = shaper.set_bandwidth_limit(1000).await.unwrap_err();
    assert!(err.is_illegal_transition(), "{err}");
    assert!(!shaper.is_connected().await);
    assert!(shaper.set_packet_loss(101).await.is_err());
    Ok(())
}

#[tokio::test]
async fn shaper_joins_the_parent_pod() -> anyhow::Result<()> {
    let server = mockito::Server::new_async().await;
    let (t, web, shaper) = shaped_web(&server).await?;

    assert_eq!(shaper.instance().state().await, InstanceState::Started);
    assert_eq!(shaper.instance().parent().await.as_deref(), Some(web.generated_name()));

    let pod = t
        .client
        .object(ResourceKind::ReplicaSet, web.generated_name())
        .and_then(|m| m.into_replica_set())
        .and_then(|rs| rs.spec)
        .and_then(|spec| spec.template)
        .and_then(|tpl| tpl.spec)
        .ok_or_else(|| anyhow::anyhow!("no pod template"))?;
    assert_eq!(pod.containers.len(), 2);
    let shaper_container = &pod.containers[1];
    let security = shaper_container
        .security_context
        .clone()
        .ok_or_else(|| anyhow::anyhow!("no security context"))?;
    assert_eq!(security.privileged, Some(true));
    let added = security.capabilities.and_then(|c| c.add).unwrap_or_default();
    assert!(added.contains(&"NET_ADMIN".to_string()));

    let ports: Vec<i32> = t
        .client
        .object(ResourceKind::Service, web.generated_name())
        .and_then(|m| m.into_service())
        .and_then(|svc| svc.spec)
        .and_then(|spec| spec.ports)
        .unwrap_or_default()
        .iter()
        .map(|p| p.port)
        .collect();
    assert_eq!(ports, vec![80, 9007]);

    web.destroy().await?;
    assert_eq!(shaper.instance().state().await, InstanceState::Destroyed);
    Ok(())
}

#[tokio::test]
async fn wait_ready_polls_the_status_endpoint() -> anyhow::Result<()> {
    let mut server = mockito::Server::new_async().await;
    let status = server
        .mock("GET", "/api/v1/services/status")
        .with_status(200)
        .with_body(json!([{"name": "bandwidth", "ready": true, "network_interface_name": "eth0"}]).to_string())
        .create_async()
        .await;

    let (_t, _web, shaper) = shaped_web(&server).await?;
    shaper
        .wait_ready(&WaitOptions::new(Duration::from_secs(5)))
        .await?;
    assert!(shaper.is_connected().await);
    status.assert_async().await;
    Ok(())
}

#[tokio::test]
async fn wait_ready_gives_up_at_the_deadline() -> anyhow::Result<()> {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/api/v1/services/status")
        .with_status(200)
        .with_body("[]")
        .create_async()
        .await;

    let (_t, _web, shaper) = shaped_web(&server).await?;
    let err = shaper
        .wait_ready(&WaitOptions::new(Duration::from_millis(700)))
        .await
        .unwrap_err();
    assert!(err.is_timeout(), "{err}");
    Ok(())
}

#[tokio::test]
async fn cloned_parent_gets_its_own_shaper() -> anyhow::Result<()> {
    let server = mockito::Server::new_async().await;
    let t = test_fleet_with_endpoint(&server.url())?;
    let web = t.fleet.new_instance("web")?;
    web.set_image("nginx:1.27").await?;
    web.commit().await?;
    let shaper = web.enable_network_shaper().await?;

    let copy = web.clone_with_name("web-2").await?;
    let sidecars = copy.sidecars().await;
    assert_eq!(sidecars.len(), 1);
    let cloned = sidecars[0].instance();
    assert_ne!(cloned.generated_name(), shaper.instance().generated_name());
    assert_eq!(cloned.parent().await.as_deref(), Some(copy.generated_name()));
    assert_eq!(cloned.image().await, shaper.instance().image().await);
    assert_eq!(cloned.state().await, InstanceState::Committed);
    Ok(())
}
