//! Compute responder: answers other backends' compute requests.
//!
//! Consumes the store subscription for the compute channel, filters for
//! requests targeting this backend, runs the finder, and writes the
//! response record. No retries: the origin's poller owns the TTL budget.

use tokio::sync::mpsc;
use tracing::{debug, warn};

use warpproto::records::{ComputeRequest, ComputeResponse};

use crate::ctx::Ctx;

#[derive(Clone)]
pub struct ComputeResponder {
    ctx: Ctx,
}

impl ComputeResponder {
    pub fn new(ctx: Ctx) -> Self {
        Self { ctx }
    }

    pub fn start(self, mut rx: mpsc::Receiver<String>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(raw) = rx.recv().await {
                if !self.ctx.store.is_running() {
                    continue;
                }

                let req: ComputeRequest = match serde_json::from_str(&raw) {
                    Ok(r) => r,
                    Err(e) => {
                        warn!(err = %e, "bad compute request json");
                        continue;
                    }
                };

                if !req.target_server.eq_ignore_ascii_case(&self.ctx.server_name()) {
                    continue;
                }

                // Finder runs can take seconds; don't hold up the channel.
                let this = self.clone();
                tokio::spawn(async move { this.handle(req).await });
            }
        })
    }

    async fn handle(&self, req: ComputeRequest) {
        let server = self.ctx.server_name();
        debug!(
            request = %req.request_id,
            player = %req.player,
            world = %req.world,
            "compute request received"
        );

        let resp = match self.ctx.finder.find_safe(&req.world).await {
            Some(loc) => ComputeResponse::success(&req.request_id, &server, &loc),
            None => ComputeResponse::failure(&req.request_id, &server, &req.world, "no_safe_location"),
        };

        if !self.ctx.store.is_running() {
            return;
        }

        let key = self.ctx.keys.resp(&req.request_id);
        let ttl = self.ctx.cfg.get().rtp.request_ttl_seconds;
        let json = match serde_json::to_string(&resp) {
            Ok(j) => j,
            Err(e) => {
                warn!(err = %e, "compute response encode failed");
                return;
            }
        };

        if let Err(e) = self.ctx.store.setex(&key, ttl, &json).await {
            warn!(request = %req.request_id, err = %e, "failed to write compute response");
        }
    }
}
