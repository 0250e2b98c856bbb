use std::convert::Infallible;
use futures_util::{StreamExt, SinkExt, future::select};
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;
use warp::{Filter, Rejection, Reply, ws::{Message as WsMsg, WebSocket}};
use airrally_lib::{Context, MotionSample, SensorFeed};
use log::{debug, info, warn};

/// A client may send one sample per text frame or a JSON array of them.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Incoming {
    One(MotionSample),
    Batch(Vec<MotionSample>),
}

fn with_feed(
    feed: SensorFeed,
) -> impl Filter<Extract = (SensorFeed,), Error = Infallible> + Clone {
    warp::any().map(move || feed.clone())
}

fn with_ctx(
    ctx: Context,
) -> impl Filter<Extract = (Context,), Error = Infallible> + Clone {
    warp::any().map(move || ctx.clone())
}

/// Build the WebSocket route under `/motion`: samples in, feedback out.
pub fn motion_routes(
    feed: SensorFeed,
    ctx: Context,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let cors = warp::cors()
        .allow_any_origin()
        .allow_methods(vec!["GET", "OPTIONS"])
        .allow_headers(vec!["sec-websocket-protocol", "origin", "upgrade"]);

    warp::path("motion")
        .and(warp::ws())
        .and(with_feed(feed))
        .and(with_ctx(ctx))
        .map(|ws: warp::ws::Ws, feed, ctx| {
            ws.on_upgrade(move |socket| handle_ws(socket, feed, ctx))
        })
        .with(cors)
}

async fn handle_ws(ws: WebSocket, feed: SensorFeed, ctx: Context) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let mut rx = ctx.subscribe();
    info!("motion client connected");

    // Incoming samples → sensor feed
    let inbound = async {
        let mut dropped = 0u64;
        while let Some(result) = ws_rx.next().await {
            let msg = match result {
                Ok(msg) => msg,
                Err(e) => {
                    warn!("motion socket error: {}", e);
                    break;
                }
            };
            if msg.is_close() {
                break;
            }
            let Ok(txt) = msg.to_str() else {
                continue;
            };
            let samples = match serde_json::from_str::<Incoming>(txt) {
                Ok(Incoming::One(sample)) => vec![sample],
                Ok(Incoming::Batch(samples)) => samples,
                Err(e) => {
                    debug!("ignoring malformed sample: {}", e);
                    continue;
                }
            };
            for sample in samples {
                if !feed.push(sample) {
                    dropped += 1;
                }
            }
        }
        if dropped > 0 {
            warn!("{} motion samples were not queued", dropped);
        }
    };

    // Feedback → client (TEXT frames)
    let outbound = async {
        loop {
            match rx.recv().await {
                Ok(note) => {
                    let txt = match serde_json::to_string(&note) {
                        Ok(txt) => txt,
                        Err(e) => {
                            warn!("could not encode feedback: {}", e);
                            continue;
                        }
                    };
                    if ws_tx.send(WsMsg::text(txt)).await.is_err() {
                        break; // client disconnected
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("motion client lagged, dropped {} notifications", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    };

    // Run inbound and outbound until one finishes
    select(Box::pin(inbound), Box::pin(outbound)).await;
    info!("motion client disconnected");
}
