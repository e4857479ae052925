//! Remote dispatch: publish a compute request, poll for the response,
//! write the pending record, then ask the proxy to switch the player.
//!
//! The pending record is durable in the store BEFORE the switch request
//! goes out, so the destination's Join Finalizer can never race a missing
//! key. A rejected switch deletes the pending again.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use warpproto::PlayerId;
use warpproto::records::{ComputeRequest, ComputeResponse, PendingTeleport};

use crate::attempt::{Attempt, RtpService};
use crate::ctx::{Ctx, now_ms};
use crate::game::{Job, Recipient};

/// Random unique request id (16 bytes, hex).
pub fn new_request_id() -> String {
    let mut b = [0u8; 16];
    let _ = getrandom::getrandom(&mut b);
    let mut out = String::with_capacity(32);
    for x in b {
        out.push_str(&format!("{x:02x}"));
    }
    out
}

/// Poll `resp:<request_id>` until the deadline. The first non-empty read
/// deletes the key; a malformed record counts as a timeout. Self-cancels on
/// deadline, cancel flag, or store stop.
pub async fn wait_for_compute_response(
    ctx: &Ctx,
    request_id: &str,
    cancelled: impl Fn() -> bool,
) -> Option<ComputeResponse> {
    let cfg = ctx.cfg.get();
    let ttl = cfg.rtp.request_ttl_seconds;
    let poll_ticks = cfg.rtp.response_poll_interval_ticks.clamp(1, 40);
    let interval = ctx.game.ticks(poll_ticks);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(ttl);
    let resp_key = ctx.keys.resp(request_id);

    loop {
        if cancelled() || !ctx.store.is_running() || tokio::time::Instant::now() >= deadline {
            return None;
        }

        if let Ok(Some(raw)) = ctx.store.get(&resp_key).await {
            if !raw.trim().is_empty() {
                let _ = ctx.store.del(&resp_key).await;
                return serde_json::from_str(&raw).ok();
            }
        }

        tokio::time::sleep(interval).await;
    }
}

/// Remote leg of an attempt; called on the game thread after the cooldown
/// gate, spawns its own workers.
pub(crate) fn run_remote(
    svc: RtpService,
    attempt: Arc<Attempt>,
    target: PlayerId,
    feedback: Recipient,
    server: String,
    world: String,
    admin: bool,
) {
    let ctx = svc.ctx.clone();
    tokio::spawn(async move {
        if attempt.is_cancelled() {
            return;
        }

        let request_id = new_request_id();
        let req = ComputeRequest {
            request_id: request_id.clone(),
            player: target,
            target_server: server.clone(),
            world: world.clone(),
            created_at_ms: now_ms(),
        };

        let channel = ctx.keys.compute_channel();
        let json = match serde_json::to_string(&req) {
            Ok(j) => j,
            Err(_) => return,
        };
        if ctx.store.publish(&channel, &json).await.is_err() {
            fail(&ctx, &svc, attempt, feedback, "errors.compute-timeout");
            return;
        }

        let resp = {
            let attempt = attempt.clone();
            wait_for_compute_response(&ctx, &request_id, move || attempt.is_cancelled()).await
        };

        ctx.game.run(move |gs| {
            if attempt.is_cancelled() {
                return;
            }

            let Some(resp) = resp.filter(|r| r.ok) else {
                svc.clear(&attempt);
                gs.notify(feedback, "errors.no-safe-location", &[]);
                return;
            };

            let do_switch: Job = {
                let svc = svc.clone();
                let attempt = attempt.clone();
                Box::new(move |gs| {
                    if attempt.is_cancelled() || !gs.is_online(target) {
                        return;
                    }
                    write_pending_then_switch(svc, attempt, target, feedback, resp, admin);
                })
            };

            if admin {
                do_switch(gs);
            } else {
                svc.countdown_then(gs, attempt, target, do_switch);
            }
        });
    });
}

fn write_pending_then_switch(
    svc: RtpService,
    attempt: Arc<Attempt>,
    target: PlayerId,
    feedback: Recipient,
    resp: ComputeResponse,
    admin: bool,
) {
    let ctx = svc.ctx.clone();
    tokio::spawn(async move {
        let pending = PendingTeleport::new(&resp.server, &resp.location(), now_ms());
        let pending_key = ctx.keys.pending(target);
        let ttl = ctx.cfg.get().rtp.request_ttl_seconds;
        let json = match serde_json::to_string(&pending) {
            Ok(j) => j,
            Err(_) => return,
        };

        // Pending must be durable before any switch request goes out.
        if ctx.store.setex(&pending_key, ttl, &json).await.is_err() {
            fail(&ctx, &svc, attempt, feedback, "errors.compute-timeout");
            return;
        }

        let server = resp.server.clone();
        ctx.game.run(move |gs| {
            if attempt.is_cancelled() || !gs.is_online(target) {
                // Best-effort cleanup; the pending must not fire later.
                svc.ctx.del_async(pending_key);
                return;
            }

            svc.clear(&attempt);

            let target_name = gs.player(target).map(|p| p.name.clone()).unwrap_or_default();
            if admin && feedback != Recipient::Player(target) {
                gs.notify(
                    feedback,
                    "status.switching-other",
                    &[("player", target_name), ("server", server.clone())],
                );
            } else {
                gs.notify(
                    Recipient::Player(target),
                    "status.switching",
                    &[("server", server.clone())],
                );
            }

            let sent = svc.ctx.proxy.request_switch(target, &server);
            if !sent {
                svc.ctx.del_async(pending_key);
                gs.notify(Recipient::Player(target), "errors.compute-timeout", &[]);
                warn!(player = %target, server = %server, "proxy switch request failed to send");
            }
        });
    });
}

fn fail(ctx: &Ctx, svc: &RtpService, attempt: Arc<Attempt>, feedback: Recipient, key: &'static str) {
    let svc = svc.clone();
    ctx.game.run(move |gs| {
        if attempt.is_cancelled() {
            return;
        }
        svc.clear(&attempt);
        gs.notify(feedback, key, &[]);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_are_unique_hex() {
        let a = new_request_id();
        let b = new_request_id();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn poller_times_out_without_responder() {
        let tb = crate::testutil::TestBackend::lobby_with(|cfg| {
            cfg.rtp.request_ttl_seconds = 1;
        })
        .await;
        let started = tokio::time::Instant::now();
        let resp = wait_for_compute_response(&tb.ctx, "deadbeef", || false).await;
        assert!(resp.is_none());
        assert!(started.elapsed() >= Duration::from_millis(900));
    }

    #[tokio::test]
    async fn poller_claims_and_deletes_response() {
        let tb = crate::testutil::TestBackend::lobby().await;
        let key = tb.ctx.keys.resp("r1");
        let resp = ComputeResponse::success(
            "r1",
            "smp",
            &warpproto::records::Location::new("world", 50.0, 64.0, 50.0, 0.0, 0.0),
        );
        tb.ctx
            .store
            .setex(&key, 30, &serde_json::to_string(&resp).unwrap())
            .await
            .unwrap();

        let got = wait_for_compute_response(&tb.ctx, "r1", || false)
            .await
            .expect("claimed");
        assert_eq!(got, resp);
        // First reader deleted the key; a second poll can only time out.
        assert_eq!(tb.ctx.store.get(&key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn poller_self_cancels_on_cancel_flag() {
        let tb = crate::testutil::TestBackend::lobby().await;
        let resp = wait_for_compute_response(&tb.ctx, "r2", || true).await;
        assert!(resp.is_none());
    }
}
