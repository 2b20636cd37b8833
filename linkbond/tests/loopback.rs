//! Two demo endpoints over loopback UDP: nomination, eligibility, frame
//! exchange, and QoS sampling end to end.

use std::time::Duration;

use anyhow::Result;
use linkbond::config::DemoConfig;
use linkbond::runtime::{bind_sockets, now_ms, report, start_endpoint};
use linkbond_core::Policy;
use tokio::sync::watch;

#[tokio::test]
async fn test_loopback_balance_rr_exchange() -> Result<()> {
    let mut cfg = DemoConfig::default();
    cfg.template.policy = Policy::BalanceRr;
    cfg.template.failover_interval = 500;
    cfg.template.packets_per_link = 4;
    cfg.paths_per_node = 2;

    let (a_sockets, a_addrs) = bind_sockets(cfg.paths_per_node).await?;
    let (b_sockets, b_addrs) = bind_sockets(cfg.paths_per_node).await?;

    let (stop_tx, stop_rx) = watch::channel(false);
    let alpha = start_endpoint("alpha", 1, 2, &cfg, a_sockets, &b_addrs, stop_rx.clone())?;
    let beta = start_endpoint("beta", 2, 1, &cfg, b_sockets, &a_addrs, stop_rx)?;

    assert_eq!(alpha.bond.path_count(), 2);
    assert_eq!(beta.bond.path_count(), 2);

    // Let traffic, heartbeats, and at least one QoS interval pass.
    let deadline = now_ms() + 5000;
    loop {
        tokio::time::sleep(Duration::from_millis(200)).await;
        let a = report(&alpha);
        let b = report(&beta);
        let done = a.frames_in > 20 && b.frames_in > 20;
        if done || now_ms() > deadline {
            break;
        }
    }

    let _ = stop_tx.send(true);
    let a = report(&alpha);
    let b = report(&beta);
    for endpoint in [alpha, beta] {
        // Tasks shut down cleanly once stop is observed.
        for task in endpoint.into_tasks() {
            let _ = tokio::time::timeout(Duration::from_secs(2), task).await;
        }
    }

    assert!(a.frames_out > 20, "alpha sent too little: {a:?}");
    assert!(b.frames_out > 20, "beta sent too little: {b:?}");
    assert!(a.frames_in > 20, "alpha received too little: {a:?}");
    assert!(b.frames_in > 20, "beta received too little: {b:?}");
    // Both links carry traffic and stay eligible, so the bonds are healthy.
    assert!(a.healthy, "alpha unhealthy: {a:?}");
    assert!(b.healthy, "beta unhealthy: {b:?}");
    Ok(())
}

#[tokio::test]
async fn test_loopback_qos_latency_sampling() -> Result<()> {
    let mut cfg = DemoConfig::default();
    cfg.template.policy = Policy::BalanceXor;
    // Short failover interval so QoS measurements (2 x failover) flow fast.
    cfg.template.failover_interval = 250;
    cfg.paths_per_node = 1;

    let (a_sockets, a_addrs) = bind_sockets(cfg.paths_per_node).await?;
    let (b_sockets, b_addrs) = bind_sockets(cfg.paths_per_node).await?;

    let (stop_tx, stop_rx) = watch::channel(false);
    let alpha = start_endpoint("alpha", 1, 2, &cfg, a_sockets, &b_addrs, stop_rx.clone())?;
    let beta = start_endpoint("beta", 2, 1, &cfg, b_sockets, &a_addrs, stop_rx)?;

    // Wait until the QoS round trip produced latency samples on alpha.
    let mut sampled = false;
    for _ in 0..40 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let metrics = alpha.bond.path_metrics(&alpha.paths[0]).unwrap();
        if metrics.latency_sample_count > 0 && metrics.eligible {
            // Loopback one-way latency estimates sit near zero.
            assert!(metrics.latency_mean < 50.0, "latency {metrics:?}");
            sampled = true;
            break;
        }
    }
    let _ = stop_tx.send(true);
    for endpoint in [alpha, beta] {
        for task in endpoint.into_tasks() {
            let _ = tokio::time::timeout(Duration::from_secs(2), task).await;
        }
    }
    assert!(sampled, "no QoS latency samples observed on alpha");
    Ok(())
}
