// src/main.rs

mod feedback;
mod motion_ws;
use dotenv::dotenv;
use std::{env, error::Error, net::SocketAddr};
use log::{info, warn, error};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task;
use warp::Filter;
use airrally_lib::{
    Context,        // feedback broadcast
    RallyConfig,
    SensorFeed,     // motion samples → session
    Side,
    run_match,
    run_replay,     // JSON-lines file → sensor feed
};

/* RUST_LOG=airrally_lib=debug,airrally_server=info \
AIRRALLY_LISTEN=0.0.0.0:7400 cargo run -p airrally-server */

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> Result<(), Box<dyn Error>> {
    // ──────── ① Load .env if present ────────
    let dotenv_result = dotenv();

    // initialize logger and panic hook
    env_logger::init();
    std::panic::set_hook(Box::new(|info| {
        error!("Thread panic: {:?}", info);
    }));
    if let Err(e) = dotenv_result {
        info!("No .env file loaded ({}), using the process environment", e);
    }

    // ──────── ② Match configuration ────────
    let config = RallyConfig::from_env()?;
    let http_port: u16 = env::var("AIRRALLY_HTTP_PORT")
        .unwrap_or_else(|_| "3030".into())
        .parse()
        .map_err(|_| "AIRRALLY_HTTP_PORT must be a port number")?;

    // ──────── ③ Open the peer transport ────────
    let (stream, listening) = match (env::var("AIRRALLY_LISTEN"), env::var("AIRRALLY_PEER")) {
        (Ok(addr), _) => {
            let listener = TcpListener::bind(&addr).await?;
            info!("Waiting for peer on {}", addr);
            let (stream, peer) = listener.accept().await?;
            info!("Peer connected from {}", peer);
            (stream, true)
        }
        (Err(_), Ok(addr)) => {
            let stream = TcpStream::connect(&addr).await?;
            info!("Connected to peer at {}", addr);
            (stream, false)
        }
        _ => return Err("Set AIRRALLY_LISTEN or AIRRALLY_PEER".into()),
    };
    stream.set_nodelay(true)?;

    // The listening side serves first unless told otherwise.
    let first_server = match env::var("AIRRALLY_SERVE_FIRST").ok().as_deref() {
        None if listening => Side::Local,
        None => Side::Remote,
        Some("local") => Side::Local,
        Some("remote") => Side::Remote,
        Some(other) => {
            return Err(format!("AIRRALLY_SERVE_FIRST must be local or remote, got {:?}", other).into());
        }
    };

    // build shared broadcast context (holds a broadcast::Sender<_>)
    let ctx = Context::new(1024);
    let (feed, samples) = SensorFeed::channel(512);
    feed.start()?;

    // ──────── ④ Optional replay source ────────
    if let Ok(path) = env::var("AIRRALLY_REPLAY") {
        let replay_feed = feed.clone();
        task::spawn_blocking(move || {
            if let Err(e) = run_replay(replay_feed, &path) {
                error!("Replay of {} failed: {}", path, e);
            }
        });
    }

    // ──────── ⑤ HTTP: health + feedback SSE + motion WS ────────
    let health = warp::path!("health").map(|| "OK");
    let routes = health
        .or(feedback::feedback_routes(ctx.clone()))
        .or(motion_ws::motion_routes(feed.clone(), ctx.clone()));
    let http_addr = SocketAddr::from(([0, 0, 0, 0], http_port));
    info!("HTTP  : {} (health)", http_addr);
    info!("SSE   : {}/feedback", http_addr);
    info!("WS    : {}/motion", http_addr);
    tokio::spawn(warp::serve(routes).run(http_addr));

    // ──────── ⑥ Ctrl-C → shutdown ────────
    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, ending match");
            let _ = stop_tx.send(true);
        }
    });

    // ──────── ⑦ Play ────────
    let outcome = run_match(stream, samples, ctx, config, first_server, stop_rx).await;
    feed.stop();
    match outcome {
        Ok(summary) => {
            info!("Match summary: {}", serde_json::to_string(&summary)?);
            Ok(())
        }
        Err(e) => {
            warn!("Match aborted: {}", e);
            Err(e.into())
        }
    }
}
