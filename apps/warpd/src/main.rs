use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{Level, info, warn};

use warpcore::Backend;
use warpcore::config::{Config, ConfigHandle};
use warpcore::ctx::Ctx;
use warpcore::finder::{RingFinder, SurfacePolicy};
use warpcore::game::{Environment, GameHandle, GameState, WorldState, spawn_game_loop};
use warpcore::proxy::GatewayProxy;
use warpproto::gateway::{GatewayReq, encode_resp, parse_req};
use warpproto::{Keys, frame};
use warpstore::{MemStore, NetStore, NetStoreConfig, Store, StoreOps};

fn usage_and_exit() -> ! {
    eprintln!(
        "warpd\n\n\
USAGE:\n  warpd [--bind HOST:PORT] [--config PATH]\n\n\
ENV:\n  WARPD_BIND      default 127.0.0.1:4200 (gateway link)\n  WARPD_CONFIG    default warpd.toml (optional; defaults apply when absent)\n  WARPD_TICK_MS   default 50\n  WARPD_STORE     net|mem, default net (mem = single-node smoke runs)\n"
    );
    std::process::exit(2);
}

#[derive(Clone, Debug)]
struct Opts {
    bind: SocketAddr,
    config_path: PathBuf,
    tick_ms: u64,
    mem_store: bool,
}

fn parse_args() -> Opts {
    let mut bind: SocketAddr = std::env::var("WARPD_BIND")
        .unwrap_or_else(|_| "127.0.0.1:4200".to_string())
        .parse()
        .unwrap_or_else(|_| usage_and_exit());

    let mut config_path: PathBuf = std::env::var("WARPD_CONFIG")
        .unwrap_or_else(|_| "warpd.toml".to_string())
        .into();

    let tick_ms: u64 = std::env::var("WARPD_TICK_MS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(50)
        .clamp(1, 1000);

    let mem_store = std::env::var("WARPD_STORE")
        .ok()
        .is_some_and(|v| v.eq_ignore_ascii_case("mem"));

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--bind" => {
                let v = it.next().unwrap_or_else(|| usage_and_exit());
                bind = v.parse().unwrap_or_else(|_| usage_and_exit());
            }
            "--config" => {
                let v = it.next().unwrap_or_else(|| usage_and_exit());
                config_path = v.into();
            }
            "-h" | "--help" => usage_and_exit(),
            _ => usage_and_exit(),
        }
    }

    Opts {
        bind,
        config_path,
        tick_ms,
        mem_store,
    }
}

fn load_config(path: &std::path::Path) -> anyhow::Result<Config> {
    if path.is_file() {
        Config::load_path(path)
    } else {
        Ok(Config::default())
    }
}

/// Standard worlds plus anything the local server section names. The env is
/// inferred from the stock folder suffixes.
fn build_worlds(gs: &mut GameState, cfg: &Config) {
    for (name, env) in [
        ("world", Environment::Normal),
        ("world_nether", Environment::Nether),
        ("world_the_end", Environment::End),
    ] {
        gs.worlds
            .insert(name.to_string(), WorldState::new(name, env));
    }

    if let Some(srv) = cfg.rtp.server(&cfg.server_name) {
        for name in srv.worlds.keys() {
            if gs.worlds.contains_key(name) {
                continue;
            }
            let env = if name.ends_with("_nether") {
                Environment::Nether
            } else if name.ends_with("_the_end") {
                Environment::End
            } else {
                Environment::Normal
            };
            gs.worlds.insert(name.clone(), WorldState::new(name, env));
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,warpd=info".into()),
        )
        .with_target(false)
        .with_max_level(Level::INFO)
        .init();

    let opts = parse_args();
    let cfg = load_config(&opts.config_path)
        .with_context(|| format!("load config {}", opts.config_path.display()))?;
    info!(
        server = %cfg.server_name,
        bind = %opts.bind,
        tick_ms = opts.tick_ms,
        store = if opts.mem_store { "mem" } else { "net" },
        "warpd starting"
    );

    let cfg_handle = ConfigHandle::new(cfg);
    let cfg0 = cfg_handle.get();

    let mut gs = GameState::new(&cfg0.server_name);
    build_worlds(&mut gs, &cfg0);
    let (game, _game_task) = spawn_game_loop(gs, opts.tick_ms);

    let ops: Arc<dyn StoreOps> = if opts.mem_store {
        Arc::new(MemStore::new())
    } else {
        Arc::new(NetStore::new(NetStoreConfig {
            host: cfg0.store.host.clone(),
            port: cfg0.store.port,
            password: cfg0.store.password.clone(),
            database: cfg0.store.database,
            timeout_ms: cfg0.store.timeout_ms,
        }))
    };

    let keys = Keys::new(&cfg0.store.key_prefix);
    let ctx = Ctx {
        cfg: cfg_handle.clone(),
        keys,
        store: Store::new(ops),
        game: game.clone(),
        proxy: Arc::new(GatewayProxy::new(game.clone())),
        finder: Arc::new(RingFinder::new(
            cfg_handle.clone(),
            game.clone(),
            Arc::new(SurfacePolicy),
        )),
    };

    // Store/prefix changes need a restart; reload only swaps the rest.
    let reload = {
        let cfg_handle = cfg_handle.clone();
        let path = opts.config_path.clone();
        Arc::new(move || -> anyhow::Result<()> {
            let next = load_config(&path)?;
            cfg_handle.replace(next);
            info!(path = %path.display(), "config reloaded");
            Ok(())
        })
    };

    let backend = Backend::start(ctx, reload);

    let listener = TcpListener::bind(opts.bind).await?;
    info!(bind = %opts.bind, "warpd listening for gateway");

    loop {
        let (stream, peer) = listener.accept().await?;
        info!(peer = %peer, "gateway connected");

        if let Err(e) = handle_gateway(stream, backend.clone(), game.clone()).await {
            warn!(peer = %peer, err = %e, "gateway connection ended with error");
        }
        info!(peer = %peer, "gateway disconnected");
    }
}

async fn handle_gateway(
    stream: TcpStream,
    backend: Arc<Backend>,
    game: GameHandle,
) -> anyhow::Result<()> {
    let (mut rd, mut wr) = stream.into_split();

    let (out_tx, mut out_rx) = mpsc::unbounded_channel();
    game.run(move |gs| gs.set_output(out_tx));

    // Writer task: game events out to the gateway.
    let writer = tokio::spawn(async move {
        while let Some(resp) = out_rx.recv().await {
            if frame::write_frame(&mut wr, &encode_resp(&resp)).await.is_err() {
                break;
            }
        }
    });

    let result: anyhow::Result<()> = async {
        loop {
            let payload = match frame::read_frame(&mut rd).await? {
                Some(p) => p,
                None => break,
            };
            let req = match parse_req(payload) {
                Ok(r) => r,
                Err(e) => {
                    warn!(err = %e, "bad gateway frame");
                    continue;
                }
            };

            let backend = backend.clone();
            game.run(move |gs| match req {
                GatewayReq::Attach {
                    player,
                    admin,
                    pos,
                    name,
                } => backend.handle_attach(gs, player, &name, admin, pos),
                GatewayReq::Detach { player } => backend.handle_detach(gs, player),
                GatewayReq::Input { player, line } => {
                    let line = String::from_utf8_lossy(&line).to_string();
                    backend.handle_input(gs, player, &line);
                }
                GatewayReq::Move { player, pos } => backend.handle_move(gs, player, pos),
                GatewayReq::Died { player } => backend.handle_died(gs, player),
                GatewayReq::Respawn { player } => backend.handle_respawn(gs, player),
                GatewayReq::SpawnSet { player, loc } => backend.handle_spawn_set(gs, player, loc),
                GatewayReq::SpawnClear { player, loc } => {
                    backend.handle_spawn_clear(gs, player, loc)
                }
            });
        }
        Ok(())
    }
    .await;

    // The gateway owns every player connection: when it goes, so do they.
    let backend2 = backend.clone();
    game.run(move |gs| {
        let ids: Vec<_> = gs.players.keys().copied().collect();
        for id in ids {
            backend2.handle_detach(gs, id);
        }
        gs.clear_output();
    });
    writer.abort();

    result
}
