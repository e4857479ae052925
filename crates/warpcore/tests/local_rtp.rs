//! Local RTP scenarios: countdown happy path, movement cancel, cooldown.

use std::sync::Arc;
use std::time::Duration;

use warpproto::gateway::GatewayResp;
use warpproto::records::Location;
use warpstore::MemStore;

use warpcore::testutil::{TestBackend, enable_server_world};

fn msg_keys(events: &[GatewayResp]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            GatewayResp::Msg { key, .. } => Some(key.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn local_rtp_happy_path() {
    let tb = TestBackend::new("smp", Arc::new(MemStore::new()), |cfg| {
        enable_server_world(cfg, "smp", "world");
        cfg.rtp.countdown_seconds = 3;
        cfg.rtp.cooldown_seconds = 60;
    })
    .await;
    let alice = tb.join_player("Alice", false).await;

    tb.run_on_game({
        let backend = tb.backend.clone();
        move |gs| backend.handle_input(gs, alice, "rtp")
    })
    .await;

    let teleport = tb
        .wait_for_event(3000, |e| matches!(e, GatewayResp::Teleport { .. }))
        .await
        .expect("teleported");
    let GatewayResp::Teleport { player, loc } = teleport else { unreachable!() };
    assert_eq!(player, alice);
    assert_eq!(loc.world, "world");

    let success = tb
        .wait_for_event(1000, |e| {
            matches!(e, GatewayResp::Msg { key, .. } if key == "success.teleported")
        })
        .await;
    assert!(success.is_some());

    // Countdown key consumed and the cooldown is armed with its full TTL.
    let key = tb.ctx.keys.cooldown(alice);
    assert!(tb.ctx.store.get(&key).await.unwrap().is_some());
    let ttl = tb.ctx.store.ttl(&key).await.unwrap();
    assert!(ttl > 0 && ttl <= 60, "ttl={ttl}");

    // The attempt slot is free again.
    assert!(tb.rtp.live_attempt(alice).is_none());
}

#[tokio::test]
async fn countdown_sends_one_notification_per_second() {
    let tb = TestBackend::new("smp", Arc::new(MemStore::new()), |cfg| {
        enable_server_world(cfg, "smp", "world");
        cfg.rtp.countdown_seconds = 3;
    })
    .await;
    let alice = tb.join_player("Alice", false).await;

    tb.run_on_game({
        let backend = tb.backend.clone();
        move |gs| backend.handle_input(gs, alice, "rtp")
    })
    .await;

    tb.wait_for_event(3000, |e| matches!(e, GatewayResp::Teleport { .. }))
        .await
        .expect("teleported");

    // Collect whatever arrived after the teleport too.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let keys = msg_keys(&tb.drain_events().await);
    let countdowns = keys.iter().filter(|k| *k == "status.teleporting-in").count();
    assert_eq!(countdowns, 3);
}

#[tokio::test]
async fn movement_during_countdown_cancels_without_refund() {
    let tb = TestBackend::new("smp", Arc::new(MemStore::new()), |cfg| {
        enable_server_world(cfg, "smp", "world");
        cfg.rtp.countdown_seconds = 5;
        cfg.rtp.cooldown_seconds = 60;
    })
    .await;
    let alice = tb.join_player("Alice", false).await;

    tb.run_on_game({
        let backend = tb.backend.clone();
        move |gs| backend.handle_input(gs, alice, "rtp")
    })
    .await;

    // Let the monitor arm its baseline (5 stable samples) and the countdown
    // begin, then jump.
    tokio::time::sleep(Duration::from_millis(600)).await;
    tb.run_on_game({
        let backend = tb.backend.clone();
        move |gs| {
            let mut pos = gs.player(alice).unwrap().pos.clone();
            pos.y += 0.35;
            backend.handle_move(gs, alice, pos);
        }
    })
    .await;

    let cancelled = tb
        .wait_for_event(1000, |e| {
            matches!(e, GatewayResp::Msg { key, .. } if key == "errors.teleport-cancelled-moved")
        })
        .await;
    assert!(cancelled.is_some(), "expected movement cancel");

    // No teleport ever happens and the slot is cleared.
    assert!(
        tb.wait_for_event(1500, |e| matches!(e, GatewayResp::Teleport { .. }))
            .await
            .is_none()
    );
    assert!(tb.rtp.live_attempt(alice).is_none());

    // The cooldown was consumed, not refunded.
    let key = tb.ctx.keys.cooldown(alice);
    assert!(tb.ctx.store.get(&key).await.unwrap().is_some());
}

#[tokio::test]
async fn cooldown_blocks_second_attempt_until_expiry() {
    let tb = TestBackend::new("smp", Arc::new(MemStore::new()), |cfg| {
        enable_server_world(cfg, "smp", "world");
        cfg.rtp.cooldown_seconds = 1;
    })
    .await;
    let alice = tb.join_player("Alice", false).await;

    let rtp_once = |tb: &TestBackend| {
        let backend = tb.backend.clone();
        let game = tb.game();
        async move {
            game.query(move |gs| backend.commands.handle(gs, alice, ""))
                .await;
        }
    };

    rtp_once(&tb).await;
    tb.wait_for_event(2000, |e| matches!(e, GatewayResp::Teleport { .. }))
        .await
        .expect("first rtp lands");

    rtp_once(&tb).await;
    let blocked = tb
        .wait_for_event(1000, |e| {
            matches!(e, GatewayResp::Msg { key, .. } if key == "cooldown.active")
        })
        .await;
    assert!(blocked.is_some(), "second attempt inside the window is rejected");

    tokio::time::sleep(Duration::from_millis(1100)).await;
    rtp_once(&tb).await;
    tb.wait_for_event(2000, |e| matches!(e, GatewayResp::Teleport { .. }))
        .await
        .expect("attempt after expiry passes the gate");
}

#[tokio::test]
async fn no_safe_location_fails_the_attempt() {
    let tb = TestBackend::new("smp", Arc::new(MemStore::new()), |cfg| {
        enable_server_world(cfg, "smp", "world");
        // Force the finder to give up: every try is pregen-gated and nothing
        // is generated.
        cfg.rtp.max_tries = 4;
        cfg.rtp.pregen_attempts = 4;
    })
    .await;
    tb.run_on_game(|gs| {
        gs.world_mut("world").unwrap().pregen_all = false;
    })
    .await;
    let alice = tb.join_player("Alice", false).await;

    tb.run_on_game({
        let backend = tb.backend.clone();
        move |gs| backend.handle_input(gs, alice, "rtp")
    })
    .await;

    let failed = tb
        .wait_for_event(2000, |e| {
            matches!(e, GatewayResp::Msg { key, .. } if key == "errors.no-safe-location")
        })
        .await;
    assert!(failed.is_some());
    assert!(tb.rtp.live_attempt(alice).is_none());

    // Placeholder position unchanged: nobody teleported.
    let moved = tb
        .game()
        .query(move |gs| gs.player(alice).unwrap().pos.clone())
        .await
        .unwrap();
    assert_eq!((moved.x, moved.z), (0.5, 0.5));
}

#[tokio::test]
async fn spawn_set_and_clear_round_trip_through_the_store() {
    let tb = TestBackend::new("smp", Arc::new(MemStore::new()), |cfg| {
        cfg.spawning.cross_server_respawn = true;
    })
    .await;
    let alice = tb.join_player("Alice", false).await;
    let bed = Location::new("world", 12.5, 64.0, -7.5, 0.0, 0.0);

    tb.run_on_game({
        let backend = tb.backend.clone();
        let bed = bed.clone();
        move |gs| {
            gs.world_mut("world")
                .unwrap()
                .spawn_blocks
                .insert((12, 64, -8), warpcore::game::SpawnBlock::Bed);
            backend.handle_spawn_set(gs, alice, bed);
        }
    })
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let key = tb.ctx.keys.spawn(alice);
    assert!(tb.ctx.store.get(&key).await.unwrap().is_some());

    tb.run_on_game({
        let backend = tb.backend.clone();
        move |gs| backend.handle_spawn_clear(gs, alice, bed)
    })
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(tb.ctx.store.get(&key).await.unwrap().is_none());
}
