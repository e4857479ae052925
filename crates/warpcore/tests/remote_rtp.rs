//! Cross-server scenarios: two in-process backends sharing one store.
//!
//! The "proxy" is the test itself: when the origin emits a Switch, the test
//! detaches the player there and attaches them on the destination, exactly
//! like the real gateway would.

use std::sync::Arc;
use std::time::Duration;

use warpproto::gateway::GatewayResp;
use warpproto::records::PendingTeleport;
use warpstore::MemStore;

use warpcore::testutil::{TestBackend, enable_server_world};

async fn fleet() -> (TestBackend, TestBackend, Arc<MemStore>) {
    let store = Arc::new(MemStore::new());

    let origin = TestBackend::new("lobby", store.clone(), |cfg| {
        enable_server_world(cfg, "smp", "world");
    })
    .await;

    let dest = TestBackend::new("smp", store.clone(), |cfg| {
        enable_server_world(cfg, "smp", "world");
    })
    .await;

    // Give both subscribers a beat to register on the channel.
    tokio::time::sleep(Duration::from_millis(50)).await;
    (origin, dest, store)
}

#[tokio::test]
async fn remote_rtp_happy_path() {
    let (origin, dest, _store) = fleet().await;
    let bob = origin.join_player("Bob", false).await;

    origin
        .run_on_game({
            let backend = origin.backend.clone();
            move |gs| backend.handle_input(gs, bob, "rtp smp")
        })
        .await;

    let switch = origin
        .wait_for_event(5000, |e| matches!(e, GatewayResp::Switch { .. }))
        .await
        .expect("origin asks the proxy to switch");
    let GatewayResp::Switch { player, server } = switch else { unreachable!() };
    assert_eq!(player, bob);
    assert_eq!(server, "smp");

    // The pending record was durable before the switch request.
    let pending_key = origin.ctx.keys.pending(bob);
    let raw = origin
        .ctx
        .store
        .get(&pending_key)
        .await
        .unwrap()
        .expect("pending written before switch");
    let pending: PendingTeleport = serde_json::from_str(&raw).unwrap();
    assert_eq!(pending.server, "smp");
    assert_eq!(pending.world, "world");
    assert_eq!(pending.attempts, 0);

    // Status messages on the origin side.
    let keys: Vec<String> = origin
        .drain_events()
        .await
        .iter()
        .filter_map(|e| match e {
            GatewayResp::Msg { key, .. } => Some(key.clone()),
            _ => None,
        })
        .collect();
    assert!(keys.contains(&"status.searching-remote".to_string()));
    assert!(keys.contains(&"status.switching".to_string()));

    // Proxy moves the player.
    origin.detach_player(bob).await;
    dest.join_player_with_id(bob, "Bob", false).await;

    let teleport = dest
        .wait_for_event(5000, |e| matches!(e, GatewayResp::Teleport { .. }))
        .await
        .expect("destination finalizes");
    let GatewayResp::Teleport { loc, .. } = teleport else { unreachable!() };
    assert_eq!(loc.world, "world");
    assert!(
        (loc.x - pending.x).abs() < 0.01 && (loc.z - pending.z).abs() < 0.01,
        "finalize lands on the computed location"
    );

    dest.wait_for_event(2000, |e| {
        matches!(e, GatewayResp::Msg { key, .. } if key == "success.teleported")
    })
    .await
    .expect("arrival message");

    // Pending consumed; freeze released.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(dest.ctx.store.get(&pending_key).await.unwrap().is_none());
    assert!(!dest.finalizer.is_frozen(bob));
}

#[tokio::test]
async fn compute_timeout_without_responder() {
    let store = Arc::new(MemStore::new());
    let origin = TestBackend::new("lobby", store, |cfg| {
        enable_server_world(cfg, "smp", "world");
        cfg.rtp.request_ttl_seconds = 1;
    })
    .await;
    let bob = origin.join_player("Bob", false).await;

    origin
        .run_on_game({
            let backend = origin.backend.clone();
            move |gs| backend.handle_input(gs, bob, "rtp smp")
        })
        .await;

    let failed = origin
        .wait_for_event(3000, |e| {
            matches!(e, GatewayResp::Msg { key, .. } if key == "errors.no-safe-location")
        })
        .await;
    assert!(failed.is_some(), "poller deadline surfaces a failure");

    // No pending was ever written, and the attempt slot is free.
    let pending_key = origin.ctx.keys.pending(bob);
    assert!(origin.ctx.store.get(&pending_key).await.unwrap().is_none());
    assert!(origin.rtp.live_attempt(bob).is_none());
}

#[tokio::test]
async fn death_precompute_routes_respawn_to_fallback_server() {
    let store = Arc::new(MemStore::new());

    // "hub" has no RTP worlds of its own; it falls back to smp.
    let hub = TestBackend::new("hub", store.clone(), |cfg| {
        enable_server_world(cfg, "smp", "world");
        cfg.spawning.random_teleport_respawn = true;
        cfg.rtp.fallback_enabled_servers = vec!["smp".to_string()];
    })
    .await;
    let dest = TestBackend::new("smp", store.clone(), |cfg| {
        enable_server_world(cfg, "smp", "world");
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let carol = hub.join_player("Carol", false).await;

    hub.run_on_game({
        let backend = hub.backend.clone();
        move |gs| backend.handle_died(gs, carol)
    })
    .await;

    // The plan (compute + pending pre-write) completes during the death
    // screen.
    let pending_key = hub.ctx.keys.pending(carol);
    let mut pending_raw = None;
    for _ in 0..40 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if let Some(raw) = hub.ctx.store.get(&pending_key).await.unwrap() {
            pending_raw = Some(raw);
            break;
        }
    }
    let pending: PendingTeleport =
        serde_json::from_str(&pending_raw.expect("pending pre-written at death time")).unwrap();
    assert_eq!(pending.server, "smp");

    hub.run_on_game({
        let backend = hub.backend.clone();
        move |gs| backend.handle_respawn(gs, carol)
    })
    .await;

    // Masked local respawn, then the switch once the plan future resolves.
    let switch = hub
        .wait_for_event(3000, |e| matches!(e, GatewayResp::Switch { .. }))
        .await
        .expect("respawn routes to the fallback server");
    assert!(matches!(switch, GatewayResp::Switch { server, .. } if server == "smp"));

    let masked = hub
        .game()
        .query(move |gs| {
            let p = gs.player(carol).unwrap();
            (p.blindness_until_tick > 0, p.invisibility_until_tick > 0, p.dead)
        })
        .await
        .unwrap();
    assert_eq!(masked, (true, true, false), "respawned under the visual mask");

    // Proxy moves Carol; destination finalizes and consumes the pending.
    hub.detach_player(carol).await;
    dest.join_player_with_id(carol, "Carol", false).await;

    dest.wait_for_event(5000, |e| matches!(e, GatewayResp::Teleport { .. }))
        .await
        .expect("destination finalizes the death plan");
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(dest.ctx.store.get(&pending_key).await.unwrap().is_none());
}

#[tokio::test]
async fn responder_ignores_requests_for_other_servers() {
    let (origin, dest, store) = fleet().await;

    // A request targeting a server nobody runs: both responders drop it.
    let req = warpproto::records::ComputeRequest {
        request_id: "r-nobody".to_string(),
        player: warpproto::PlayerId(77),
        target_server: "creative".to_string(),
        world: "world".to_string(),
        created_at_ms: 0,
    };
    origin
        .ctx
        .store
        .publish(
            &origin.ctx.keys.compute_channel(),
            &serde_json::to_string(&req).unwrap(),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(
        origin
            .ctx
            .store
            .get(&origin.ctx.keys.resp("r-nobody"))
            .await
            .unwrap()
            .is_none()
    );

    // Sanity: a request for smp does get answered.
    let req = warpproto::records::ComputeRequest {
        request_id: "r-smp".to_string(),
        player: warpproto::PlayerId(78),
        target_server: "SMP".to_string(), // case-insensitive match
        world: "world".to_string(),
        created_at_ms: 0,
    };
    dest.ctx
        .store
        .publish(
            &dest.ctx.keys.compute_channel(),
            &serde_json::to_string(&req).unwrap(),
        )
        .await
        .unwrap();

    let mut answered = false;
    for _ in 0..40 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if store.live_keys() > 0
            && dest
                .ctx
                .store
                .get(&dest.ctx.keys.resp("r-smp"))
                .await
                .unwrap()
                .is_some()
        {
            answered = true;
            break;
        }
    }
    assert!(answered, "responder answers requests addressed to it");
}
