//! The relay hub: a single task that owns the registry of live connections
//! and the call table. Registration, unregistration, signaling traffic and
//! queries all arrive on one command queue and are handled in order, so
//! neither map needs a lock.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{mpsc, mpsc::error::TrySendError, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::connection::ConnectionHandle;
use crate::error::RelayError;
use crate::protocol::{error_code, Role, SignalKind, SignalMessage, UserId};
use crate::session::{CallSession, CallTable};

#[derive(Debug, Clone, Copy)]
pub struct HubConfig {
    pub command_capacity: usize,
    pub sweep_interval: Duration,
    pub ended_retention: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            command_capacity: 1024,
            sweep_interval: Duration::from_secs(60),
            ended_retention: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HubStats {
    pub connections: usize,
    pub live_calls: usize,
}

enum Command {
    Register(ConnectionHandle),
    Unregister { user_id: UserId, conn_id: Uuid },
    Dispatch(SignalMessage),
    IsConnected { user_id: UserId, reply: oneshot::Sender<bool> },
    ActiveCall { a: UserId, b: UserId, reply: oneshot::Sender<Option<CallSession>> },
    Session { call_id: String, reply: oneshot::Sender<Option<CallSession>> },
    Stats { reply: oneshot::Sender<HubStats> },
    Shutdown,
}

/// Cheap, cloneable entry point into the hub. Every call is a message to
/// the dispatch task.
#[derive(Clone)]
pub struct HubHandle {
    commands: mpsc::Sender<Command>,
}

impl HubHandle {
    async fn send(&self, cmd: Command) -> Result<(), RelayError> {
        self.commands.send(cmd).await.map_err(|_| RelayError::HubClosed)
    }

    /// Adds `conn`, retiring any connection already registered for the same user.
    pub async fn register(&self, conn: ConnectionHandle) -> Result<(), RelayError> {
        self.send(Command::Register(conn)).await
    }

    /// Removes the entry for `user_id` only if it is still `conn_id`.
    pub async fn unregister(&self, user_id: UserId, conn_id: Uuid) {
        let _ = self.send(Command::Unregister { user_id, conn_id }).await;
    }

    /// Queues an already-stamped message for routing. Routing failures come
    /// back to the sender as `error` messages; the only error here is a hub
    /// that has shut down.
    pub async fn dispatch(&self, msg: SignalMessage) -> Result<(), RelayError> {
        self.send(Command::Dispatch(msg)).await
    }

    pub async fn is_connected(&self, user_id: UserId) -> bool {
        self.ask(|reply| Command::IsConnected { user_id, reply }).await.unwrap_or(false)
    }

    /// The waiting or active call between `a` and `b`, in either direction.
    pub async fn active_call_for(&self, a: UserId, b: UserId) -> Option<CallSession> {
        self.ask(|reply| Command::ActiveCall { a, b, reply }).await.flatten()
    }

    /// Any session still held in the table, ended ones included.
    pub async fn session(&self, call_id: &str) -> Option<CallSession> {
        let call_id = call_id.to_string();
        self.ask(|reply| Command::Session { call_id, reply }).await.flatten()
    }

    pub async fn stats(&self) -> Option<HubStats> {
        self.ask(|reply| Command::Stats { reply }).await
    }

    /// Stops the dispatch task. Every registered connection's queue is closed.
    pub async fn shutdown(&self) {
        let _ = self.send(Command::Shutdown).await;
    }

    async fn ask<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Option<T> {
        let (reply, rx) = oneshot::channel();
        self.send(build(reply)).await.ok()?;
        rx.await.ok()
    }
}

pub struct Hub {
    config: HubConfig,
    commands: mpsc::Receiver<Command>,
    registry: HashMap<UserId, ConnectionHandle>,
    calls: CallTable,
}

impl Hub {
    /// Starts the dispatch task. It runs until `shutdown` is called or every
    /// handle is dropped.
    pub fn spawn(config: HubConfig) -> (HubHandle, JoinHandle<()>) {
        let (tx, commands) = mpsc::channel(config.command_capacity);
        let hub = Hub {
            config,
            commands,
            registry: HashMap::new(),
            calls: CallTable::new(),
        };
        (HubHandle { commands: tx }, tokio::spawn(hub.run()))
    }

    async fn run(mut self) {
        let mut sweep = time::interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Shutdown) | None => break,
                    Some(cmd) => self.handle(cmd),
                },
                _ = sweep.tick() => self.sweep(),
            }
        }

        info!(connections = self.registry.len(), sessions = self.calls.len(), "relay hub stopped");
        // Dropping the handles closes every outbound queue
        self.registry.clear();
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Register(conn) => self.register(conn),
            Command::Unregister { user_id, conn_id } => self.unregister(user_id, conn_id),
            Command::Dispatch(msg) => self.dispatch(msg),
            Command::IsConnected { user_id, reply } => {
                let _ = reply.send(self.registry.contains_key(&user_id));
            }
            Command::ActiveCall { a, b, reply } => {
                let _ = reply.send(self.calls.live_between(a, b).cloned());
            }
            Command::Session { call_id, reply } => {
                let _ = reply.send(self.calls.get(&call_id).cloned());
            }
            Command::Stats { reply } => {
                let _ = reply.send(HubStats {
                    connections: self.registry.len(),
                    live_calls: self.calls.live_count(),
                });
            }
            Command::Shutdown => {}
        }
    }

    fn register(&mut self, conn: ConnectionHandle) {
        let user_id = conn.user_id();
        let conn_id = conn.id();
        if let Some(old) = self.registry.insert(user_id, conn) {
            info!(user_id, old = %old.id(), new = %conn_id, "connection superseded");
        }
    }

    fn unregister(&mut self, user_id: UserId, conn_id: Uuid) {
        let current = self.registry.get(&user_id).map(|c| c.id());
        if current == Some(conn_id) {
            self.registry.remove(&user_id);
            debug!(user_id, %conn_id, "connection unregistered");
        }
    }

    fn dispatch(&mut self, msg: SignalMessage) {
        match msg.kind {
            SignalKind::Ping => {
                let pong = SignalMessage::new(SignalKind::Pong, msg.session_id, msg.from, msg.from);
                if self.deliver(pong).is_err() {
                    debug!(user_id = msg.from, "pong undeliverable");
                }
            }
            SignalKind::Pong => {}
            SignalKind::Unknown => {
                warn!(from = msg.from, call_id = %msg.session_id, "dropping message of unknown type");
            }
            SignalKind::Offer | SignalKind::Answer | SignalKind::IceCandidate | SignalKind::End | SignalKind::Error => {
                match routable(&msg) {
                    Ok(to) => self.signal(msg, to),
                    Err(reason) => self.reject(&msg, reason),
                }
            }
        }
    }

    fn signal(&mut self, msg: SignalMessage, to: UserId) {
        match msg.kind {
            SignalKind::Offer => self.offer(msg, to),
            SignalKind::Answer => {
                match self.call_between(&msg.session_id, msg.from, to) {
                    Some(session) => {
                        if session.activate() {
                            info!(call_id = %msg.session_id, "call active");
                        }
                    }
                    None => debug!(call_id = %msg.session_id, "answer outside a known call, relaying anyway"),
                }
                self.route(msg, to);
            }
            SignalKind::End => {
                if let Some(session) = self.call_between(&msg.session_id, msg.from, to) {
                    if session.end(Utc::now()) {
                        info!(call_id = %msg.session_id, by = msg.from, "call ended");
                    }
                }
                self.route(msg, to);
            }
            SignalKind::IceCandidate | SignalKind::Error => self.route(msg, to),
            SignalKind::Ping | SignalKind::Pong | SignalKind::Unknown => {}
        }
    }

    /// The session for `call_id`, only if `a` and `b` are its two participants.
    fn call_between(&mut self, call_id: &str, a: UserId, b: UserId) -> Option<&mut CallSession> {
        self.calls.get_mut(call_id).filter(|s| s.is_between(a, b))
    }

    fn offer(&mut self, msg: SignalMessage, to: UserId) {
        let call_id = msg.session_id.clone();

        // Some(true): renegotiation on this pair's live call
        // Some(false): the id is live for a different pair
        let live_pair = self
            .calls
            .get(&call_id)
            .filter(|s| s.is_live())
            .map(|s| s.is_between(msg.from, to));
        match live_pair {
            Some(true) => debug!(%call_id, "renegotiation on live call"),
            Some(false) => {
                self.reject(&msg, "session_id belongs to another call");
                return;
            }
            None => {
                let caller_role = self.registry.get(&msg.from).map(|c| c.role());
                let (client, specialist) = match caller_role {
                    Some(Role::Specialist) => (to, msg.from),
                    _ => (msg.from, to),
                };
                let superseded = self.calls.open(CallSession::new(call_id.clone(), client, specialist, msg.appointment_id));
                for old in superseded {
                    info!(call_id = %old, replaced_by = %call_id, "call superseded by new offer");
                }
                info!(%call_id, client, specialist, "call waiting");
            }
        }

        let from = msg.from;
        if self.deliver(msg).is_err() {
            if let Some(session) = self.call_between(&call_id, from, to) {
                session.end(Utc::now());
            }
            self.bounce_unavailable(&call_id, from, to);
        }
    }

    /// Forwards to `to`, bouncing an error to the sender if that fails.
    fn route(&mut self, msg: SignalMessage, to: UserId) {
        let (call_id, from) = (msg.session_id.clone(), msg.from);
        if self.deliver(msg).is_err() {
            self.bounce_unavailable(&call_id, from, to);
        }
    }

    fn bounce_unavailable(&mut self, call_id: &str, sender: UserId, target: UserId) {
        debug!(call_id, sender, target, "destination unreachable");
        let err = SignalMessage::error(call_id, target, sender, error_code::USER_UNAVAILABLE, "user not available");
        if self.deliver(err).is_err() {
            debug!(user_id = sender, "error notice undeliverable");
        }
    }

    fn reject(&mut self, msg: &SignalMessage, reason: &str) {
        warn!(from = msg.from, kind = ?msg.kind, reason, "rejecting message");
        let err = SignalMessage::error(msg.session_id.clone(), msg.from, msg.from, error_code::INVALID_MESSAGE, reason);
        let _ = self.deliver(err);
    }

    /// Pushes onto the recipient's outbound queue without waiting. A full or
    /// closed queue evicts the recipient.
    fn deliver(&mut self, msg: SignalMessage) -> Result<(), ()> {
        let Some(to) = msg.to else {
            return Err(());
        };
        let Some(conn) = self.registry.get(&to) else {
            return Err(());
        };
        match conn.try_push(msg) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!(user_id = to, conn_id = %conn.id(), "outbound queue full, evicting connection");
                self.registry.remove(&to);
                Err(())
            }
            Err(TrySendError::Closed(_)) => {
                debug!(user_id = to, "outbound queue closed, removing connection");
                self.registry.remove(&to);
                Err(())
            }
        }
    }

    fn sweep(&mut self) {
        let registry = &self.registry;
        let retention = chrono::Duration::from_std(self.config.ended_retention).unwrap_or(chrono::Duration::MAX);
        let (abandoned, evicted) = self.calls.sweep(|user| registry.contains_key(&user), retention);
        if abandoned > 0 || evicted > 0 {
            info!(abandoned, evicted, remaining = self.calls.len(), "call table swept");
        }
    }
}

/// Recipient of a routed message, or why it cannot be routed.
fn routable(msg: &SignalMessage) -> Result<UserId, &'static str> {
    if msg.session_id.is_empty() {
        return Err("session_id is required");
    }
    match msg.to {
        None => Err("to is required"),
        Some(to) if to == msg.from => Err("cannot signal yourself"),
        Some(to) => Ok(to),
    }
}
