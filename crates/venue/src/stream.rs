use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bxconnect_core::{Error, Result, UserEvent};
use futures::{stream, SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::adapter::VenueAdapter;
use crate::auth::Authenticator;
use crate::transport::UserEventStream;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct StreamState<A> {
    socket: Socket,
    adapter: Arc<A>,
    heartbeat: Interval,
    pending: VecDeque<Result<UserEvent>>,
    done: bool,
}

/// Connect, authenticate and subscribe, then expose decoded events.
///
/// The returned stream yields an `Err` and ends when the socket fails, and
/// simply ends when the venue closes it.
pub async fn connect_user_stream<A: VenueAdapter>(
    ws_url: &str,
    adapter: Arc<A>,
    auth: &Authenticator,
) -> Result<UserEventStream> {
    let (mut socket, _) = connect_async(ws_url)
        .await
        .map_err(|e| Error::Transport(format!("websocket connect failed: {e}")))?;

    for msg in adapter.stream_subscription(auth)? {
        socket
            .send(Message::Text(msg.to_string().into()))
            .await
            .map_err(|e| Error::Transport(format!("websocket subscribe failed: {e}")))?;
    }
    info!(venue = adapter.name(), "user stream subscribed");

    let mut heartbeat = interval(HEARTBEAT_INTERVAL);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let state = StreamState {
        socket,
        adapter,
        heartbeat,
        pending: VecDeque::new(),
        done: false,
    };

    let events = stream::unfold(state, |mut st| async move {
        loop {
            if let Some(item) = st.pending.pop_front() {
                return Some((item, st));
            }
            if st.done {
                return None;
            }

            tokio::select! {
                _ = st.heartbeat.tick() => {
                    // Sending also flushes any queued pong replies.
                    if let Err(e) = st.socket.send(Message::Ping(Vec::new().into())).await {
                        st.done = true;
                        st.pending.push_back(Err(Error::Transport(format!("websocket ping failed: {e}"))));
                    }
                }
                msg = st.socket.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => match st.adapter.parse_user_event(&text) {
                            Ok(events) => st.pending.extend(events.into_iter().map(Ok)),
                            Err(e) => warn!(error = %e, "undecodable user stream message"),
                        },
                        Some(Ok(Message::Close(frame))) => {
                            info!(?frame, "user stream closed by venue");
                            st.done = true;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            st.done = true;
                            st.pending.push_back(Err(Error::Transport(format!("websocket error: {e}"))));
                        }
                        None => {
                            debug!("user stream ended");
                            st.done = true;
                        }
                    }
                }
            }
        }
    });

    Ok(Box::pin(events))
}
