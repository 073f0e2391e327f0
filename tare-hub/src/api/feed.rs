use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use tracing::{debug, info};

use crate::feed::{FeedHub, Subscription};

/// Longest a single consumer may take to accept one frame.
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn upgrade(ws: WebSocketUpgrade, State(hub): State<Arc<FeedHub>>) -> Response {
    ws.on_upgrade(move |socket| stream_feed(socket, hub))
}

async fn stream_feed(mut socket: WebSocket, hub: Arc<FeedHub>) {
    let Subscription { id, mut frames } = hub.subscribe().await;
    info!(subscriber = id, "Feed consumer connected");

    loop {
        tokio::select! {
            frame = frames.recv() => {
                let Some(frame) = frame else {
                    debug!(subscriber = id, "feed queue closed");
                    break;
                };
                match tokio::time::timeout(SEND_TIMEOUT, socket.send(Message::Text(frame))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        debug!(subscriber = id, error = %e, "feed send failed");
                        break;
                    }
                    Err(_) => {
                        debug!(subscriber = id, "feed send timed out");
                        break;
                    }
                }
            }

            incoming = socket.recv() => match incoming {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                // consumers have nothing to say
                Some(Ok(_)) => {}
            },
        }
    }

    hub.unsubscribe(id).await;
    info!(subscriber = id, "Feed consumer disconnected");
}
