use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::stream::SplitStream;
use futures::{sink::Sink, sink::SinkExt, stream::StreamExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::Identity;
use crate::error::RelayError;
use crate::hub::HubHandle;
use crate::protocol::{Role, SignalMessage, UserId};

// Upper bound on frames coalesced into one flush
const MAX_BATCH: usize = 64;

#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    pub outbound_capacity: usize,
    pub ping_interval: Duration,
    pub pong_wait: Duration,
    pub write_timeout: Duration,
}

/// The hub's view of a live connection. The hub holds the only sender, so
/// dropping the handle closes the outbound queue and the write loop exits.
#[derive(Debug)]
pub struct ConnectionHandle {
    id: Uuid,
    user_id: UserId,
    role: Role,
    outbound: mpsc::Sender<SignalMessage>,
}

impl ConnectionHandle {
    pub fn new(user_id: UserId, role: Role, capacity: usize) -> (Self, mpsc::Receiver<SignalMessage>) {
        let (outbound, rx) = mpsc::channel(capacity);
        let handle = Self {
            id: Uuid::new_v4(),
            user_id,
            role,
            outbound,
        };
        (handle, rx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Never waits: a full queue is reported back so the hub can evict.
    pub(crate) fn try_push(&self, msg: SignalMessage) -> Result<(), TrySendError<SignalMessage>> {
        self.outbound.try_send(msg)
    }
}

#[derive(Debug)]
enum Disconnect {
    Closed,
    KeepaliveTimeout,
    Transport(axum::Error),
    HubClosed,
}

/// Runs one connection to completion: registers it with the hub, pumps
/// frames both ways, and unregisters on the way out.
pub async fn serve(socket: WebSocket, identity: Identity, hub: HubHandle, settings: ConnectionSettings) {
    let Identity { user_id, role } = identity;
    let (handle, outbound) = ConnectionHandle::new(user_id, role, settings.outbound_capacity);
    let conn_id = handle.id();

    if hub.register(handle).await.is_err() {
        warn!(user_id, "hub unavailable, dropping connection");
        return;
    }
    info!(user_id, ?role, %conn_id, "connection registered");

    let (sink, stream) = socket.split();

    // Task 1: Flush the outbound queue to the socket and keep the link alive
    let mut write_task = tokio::spawn(write_loop(sink, outbound, settings, user_id));

    // Task 2: Receive frames and hand them to the hub
    tokio::select! {
        reason = read_loop(stream, user_id, &hub, settings.pong_wait) => {
            match reason {
                Disconnect::Transport(err) => warn!(user_id, %conn_id, error = %err, "read failed"),
                other => debug!(user_id, %conn_id, reason = ?other, "read loop finished"),
            }
        }
        _ = &mut write_task => {
            debug!(user_id, %conn_id, "write loop finished");
        }
    }

    // Cleanup: a superseded connection's unregister is ignored by the hub
    hub.unregister(user_id, conn_id).await;
    write_task.abort();
    info!(user_id, %conn_id, "connection closed");
}

async fn read_loop(mut stream: SplitStream<WebSocket>, user_id: UserId, hub: &HubHandle, pong_wait: Duration) -> Disconnect {
    loop {
        // Any inbound frame, including keepalive pongs, extends the deadline
        let frame = match time::timeout(pong_wait, stream.next()).await {
            Err(_) => return Disconnect::KeepaliveTimeout,
            Ok(None) => return Disconnect::Closed,
            Ok(Some(Err(err))) => return Disconnect::Transport(err),
            Ok(Some(Ok(frame))) => frame,
        };

        let decoded = match frame {
            Message::Text(text) => SignalMessage::decode(text.as_bytes()),
            Message::Binary(bytes) => SignalMessage::decode(&bytes),
            Message::Close(_) => return Disconnect::Closed,
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        match decoded {
            Ok(msg) => {
                if hub.dispatch(msg.stamped(user_id)).await.is_err() {
                    return Disconnect::HubClosed;
                }
            }
            Err(err) => warn!(user_id, error = %err, "dropping malformed frame"),
        }
    }
}

async fn write_loop<S>(
    mut sink: S,
    mut outbound: mpsc::Receiver<SignalMessage>,
    settings: ConnectionSettings,
    user_id: UserId,
) where
    S: Sink<Message, Error = axum::Error> + Unpin,
{
    let mut keepalive = time::interval_at(Instant::now() + settings.ping_interval, settings.ping_interval);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            next = outbound.recv() => {
                let Some(first) = next else {
                    // Queue closed by the hub: superseded, evicted or shutting down
                    let _ = time::timeout(settings.write_timeout, sink.send(Message::Close(None))).await;
                    break;
                };
                if let Err(err) = flush_batch(&mut sink, &mut outbound, first, settings.write_timeout).await {
                    warn!(user_id, error = %err, "write failed");
                    break;
                }
            }
            _ = keepalive.tick() => {
                let ping = time::timeout(settings.write_timeout, sink.send(Message::Ping(vec![].into()))).await;
                if !matches!(ping, Ok(Ok(()))) {
                    debug!(user_id, "keepalive ping failed");
                    break;
                }
            }
        }
    }
}

/// Feeds `first` plus whatever else is already queued, then flushes once.
async fn flush_batch<S>(
    sink: &mut S,
    outbound: &mut mpsc::Receiver<SignalMessage>,
    first: SignalMessage,
    write_timeout: Duration,
) -> Result<(), RelayError>
where
    S: Sink<Message, Error = axum::Error> + Unpin,
{
    let write = async {
        feed(sink, &first).await?;
        for _ in 1..MAX_BATCH {
            match outbound.try_recv() {
                Ok(msg) => feed(sink, &msg).await?,
                Err(_) => break,
            }
        }
        sink.flush().await?;
        Ok::<(), RelayError>(())
    };
    time::timeout(write_timeout, write).await.map_err(|_| RelayError::WriteTimeout)?
}

async fn feed<S>(sink: &mut S, msg: &SignalMessage) -> Result<(), RelayError>
where
    S: Sink<Message, Error = axum::Error> + Unpin,
{
    // An unencodable message is skipped rather than tearing down the connection
    match msg.encode() {
        Ok(text) => sink.feed(Message::Text(text.into())).await.map_err(RelayError::from),
        Err(err) => {
            warn!(kind = ?msg.kind, error = %err, "dropping unencodable message");
            Ok(())
        }
    }
}
