use std::convert::Infallible;
use async_stream::stream;
use airrally_lib::{Context, Feedback};
use tokio::sync::broadcast::error::RecvError;
use warp::{Filter, Rejection, Reply, sse::{Event, reply, keep_alive}};
use log::{info, warn};

/// SSE event name, so browser clients can `addEventListener` per kind.
fn event_name(feedback: &Feedback) -> &'static str {
    match feedback {
        Feedback::Swing { .. } => "swing",
        Feedback::Outcome { .. } => "outcome",
        Feedback::Notice { .. } => "notice",
        Feedback::MatchEnded { .. } => "match_ended",
    }
}

/// GET /feedback → Server-Sent Events, one JSON notification per event.
pub fn feedback_routes(
    ctx: Context,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let sse_route = warp::get()
        .and(warp::path("feedback"))
        .and(warp::path::end())
        .map(move || {
            // subscribe per client; a slow client only lags itself
            let mut rx = ctx.subscribe();
            info!("SSE client subscribed to feedback");
            let event_stream = stream! {
                loop {
                    match rx.recv().await {
                        Ok(note) => match serde_json::to_string(&note) {
                            Ok(json) => {
                                yield Ok::<_, Infallible>(
                                    Event::default().event(event_name(&note.feedback)).data(json)
                                );
                            }
                            Err(e) => warn!("could not encode feedback: {}", e),
                        },
                        Err(RecvError::Lagged(skipped)) => {
                            warn!("SSE client lagged, dropped {} notifications", skipped);
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            };
            reply(keep_alive().stream(event_stream))
        });

    let cors = warp::cors()
        .allow_any_origin()
        .allow_methods(vec!["OPTIONS", "GET"])
        .allow_headers(vec!["accept", "last-event-id", "origin"]);

    sse_route.with(cors)
}
