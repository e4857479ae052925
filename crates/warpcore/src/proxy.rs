//! Proxy connector backed by the gateway link.
//!
//! The proxy gateway owns the actual player connections, so "switch this
//! player to that backend" is one outbound frame. Accepted-for-delivery
//! means the frame was scheduled onto the game loop; arrival is the
//! destination's Join Finalizer's problem.

use warpproto::PlayerId;
use warpproto::gateway::GatewayResp;

use crate::ctx::ProxyConnector;
use crate::game::GameHandle;

pub struct GatewayProxy {
    game: GameHandle,
}

impl GatewayProxy {
    pub fn new(game: GameHandle) -> Self {
        Self { game }
    }
}

impl ProxyConnector for GatewayProxy {
    fn request_switch(&self, player: PlayerId, server: &str) -> bool {
        let server = server.to_string();
        self.game.run(move |gs| {
            if gs.is_online(player) {
                gs.send(GatewayResp::Switch { player, server });
            }
        })
    }
}
