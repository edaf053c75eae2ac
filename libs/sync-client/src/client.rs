//! Connection lifecycle client.
//!
//! `DISCONNECTED -> CONNECTING -> CONNECTED`, falling back to `CONNECTING` on
//! transport loss and retrying forever with a fixed delay. The session binding
//! is a single slot: the latest `join_session` wins and is replayed as the first
//! frame of every (re)connection.

use std::sync::Arc;

use parking_lot::Mutex;
use retro_common::events::{JoinSession, LeaveSession, Member, RosterEntry};
use retro_common::{ClientEvent, ServerEvent};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::subscribers::{Subscribers, Subscription};
use crate::transport::{Connector, Link, WsConnector};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Binding and outbound link share one lock so a join racing with readiness
/// goes out exactly once.
#[derive(Default)]
struct LinkState {
    outbound: Option<mpsc::UnboundedSender<String>>,
    binding: Option<JoinSession>,
}

struct Inner {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    state: watch::Sender<ConnectionState>,
    link: Mutex<LinkState>,
    snapshot: Subscribers<Value>,
    member_joined: Subscribers<Member>,
    member_left: Subscribers<Member>,
    roster: Subscribers<Vec<RosterEntry>>,
    ready: Subscribers<()>,
}

struct Runner {
    task: JoinHandle<()>,
    shutdown: oneshot::Sender<()>,
}

pub struct SyncClient {
    inner: Arc<Inner>,
    runner: Mutex<Option<Runner>>,
}

impl SyncClient {
    pub fn new(config: ClientConfig, connector: impl Connector) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                config,
                connector: Arc::new(connector),
                state,
                link: Mutex::new(LinkState::default()),
                snapshot: Subscribers::new(),
                member_joined: Subscribers::new(),
                member_left: Subscribers::new(),
                roster: Subscribers::new(),
                ready: Subscribers::new(),
            }),
            runner: Mutex::new(None),
        }
    }

    /// Client over a real WebSocket to `config.url`.
    pub fn websocket(config: ClientConfig) -> Self {
        let connector = WsConnector::new(config.url.clone());
        Self::new(config, connector)
    }

    /// Start the lifecycle task if it is not running, then wait until the
    /// transport is ready. Concurrent callers wait on the same attempt.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.ensure_started();
        let mut rx = self.inner.state.subscribe();
        let state = *rx
            .wait_for(|s| *s != ConnectionState::Connecting)
            .await
            .map_err(|_| ClientError::Closed)?;
        match state {
            ConnectionState::Connected => Ok(()),
            _ => Err(ClientError::Closed),
        }
    }

    fn ensure_started(&self) {
        let mut runner = self.runner.lock();
        if runner.as_ref().is_some_and(|r| !r.task.is_finished()) {
            return;
        }
        let (shutdown, shutdown_rx) = oneshot::channel();
        self.inner.state.send_replace(ConnectionState::Connecting);
        let task = tokio::spawn(run(self.inner.clone(), shutdown_rx));
        *runner = Some(Runner { task, shutdown });
    }

    /// Bind to a session. Sent now when connected, otherwise kept as the one
    /// pending join and sent on readiness.
    pub fn join_session(
        &self,
        session_id: impl Into<String>,
        user_id: impl Into<String>,
        user_name: impl Into<String>,
    ) {
        let join = JoinSession {
            session_id: session_id.into(),
            user_id: user_id.into(),
            user_name: user_name.into(),
        };
        let mut link = self.inner.link.lock();
        link.binding = Some(join.clone());
        match &link.outbound {
            Some(tx) => {
                tracing::debug!(session_id = %join.session_id, "joining session");
                send_event(tx, &ClientEvent::JoinSession(join));
            }
            None => {
                tracing::debug!(session_id = %join.session_id, "not connected, join queued");
            }
        }
    }

    /// Clear the binding. The transport stays open.
    pub fn leave_session(&self) {
        let mut link = self.inner.link.lock();
        let Some(join) = link.binding.take() else {
            return;
        };
        if let Some(tx) = &link.outbound {
            send_event(
                tx,
                &ClientEvent::LeaveSession(LeaveSession {
                    session_id: join.session_id,
                }),
            );
        }
    }

    /// Send a full snapshot to the bound room. Dropped with a warning when
    /// not connected or not bound.
    pub fn publish(&self, snapshot: Value) {
        let link = self.inner.link.lock();
        let Some(tx) = &link.outbound else {
            tracing::warn!("not connected, dropping session update");
            return;
        };
        if link.binding.is_none() {
            tracing::warn!("no session joined, dropping session update");
            return;
        }
        send_event(tx, &ClientEvent::UpdateSession(snapshot));
    }

    /// Clear the binding, stop the lifecycle task and close the transport.
    pub async fn disconnect(&self) {
        self.inner.link.lock().binding = None;
        let runner = self.runner.lock().take();
        if let Some(Runner { task, shutdown }) = runner {
            let _ = shutdown.send(());
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "sync client task ended abnormally");
            }
        }
        self.inner.go_offline();
        self.inner.state.send_replace(ConnectionState::Disconnected);
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn current_session(&self) -> Option<String> {
        self.inner
            .link
            .lock()
            .binding
            .as_ref()
            .map(|j| j.session_id.clone())
    }

    pub fn on_snapshot(&self, f: impl Fn(&Value) + Send + Sync + 'static) -> Subscription {
        self.inner.snapshot.subscribe(f)
    }

    pub fn on_member_joined(&self, f: impl Fn(&Member) + Send + Sync + 'static) -> Subscription {
        self.inner.member_joined.subscribe(f)
    }

    pub fn on_member_left(&self, f: impl Fn(&Member) + Send + Sync + 'static) -> Subscription {
        self.inner.member_left.subscribe(f)
    }

    pub fn on_roster(
        &self,
        f: impl Fn(&Vec<RosterEntry>) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.roster.subscribe(f)
    }

    /// Runs after every successful (re)connection, once the pending join
    /// has been sent.
    pub fn on_ready(&self, f: impl Fn(&()) + Send + Sync + 'static) -> Subscription {
        self.inner.ready.subscribe(f)
    }
}

impl Inner {
    fn go_online(&self, outbound: mpsc::UnboundedSender<String>) {
        let mut link = self.link.lock();
        if let Some(join) = &link.binding {
            tracing::info!(session_id = %join.session_id, "rejoining session");
            send_event(&outbound, &ClientEvent::JoinSession(join.clone()));
        }
        link.outbound = Some(outbound);
        self.state.send_replace(ConnectionState::Connected);
    }

    fn go_offline(&self) {
        self.link.lock().outbound = None;
    }

    /// Drive one live link. Returns `true` when shutdown was requested.
    async fn pump(&self, link: Link, shutdown: &mut oneshot::Receiver<()>) -> bool {
        let Link {
            outbound,
            mut inbound,
        } = link;
        self.go_online(outbound);
        self.ready.emit(&());

        loop {
            tokio::select! {
                _ = &mut *shutdown => return true,
                frame = inbound.recv() => match frame {
                    Some(text) => self.dispatch(&text),
                    None => {
                        self.go_offline();
                        self.state.send_replace(ConnectionState::Connecting);
                        return false;
                    }
                },
            }
        }
    }

    fn dispatch(&self, text: &str) {
        match serde_json::from_str::<ServerEvent>(text) {
            Ok(ServerEvent::SessionUpdate(snapshot)) => self.snapshot.emit(&snapshot),
            Ok(ServerEvent::MemberJoined(member)) => self.member_joined.emit(&member),
            Ok(ServerEvent::MemberLeft(member)) => self.member_left.emit(&member),
            Ok(ServerEvent::MemberRoster(roster)) => self.roster.emit(&roster),
            Err(e) => tracing::warn!(error = %e, "dropping undecodable frame"),
        }
    }
}

async fn run(inner: Arc<Inner>, mut shutdown: oneshot::Receiver<()>) {
    loop {
        inner.state.send_replace(ConnectionState::Connecting);
        let attempt = tokio::select! {
            _ = &mut shutdown => break,
            res = inner.connector.connect() => res,
        };

        match attempt {
            Ok(link) => {
                if inner.pump(link, &mut shutdown).await {
                    break;
                }
                tracing::warn!("connection lost, reconnecting");
            }
            Err(e) => tracing::warn!(error = %e, "connect failed"),
        }

        tokio::select! {
            _ = &mut shutdown => break,
            _ = tokio::time::sleep(inner.config.reconnect_delay) => {}
        }
    }

    inner.go_offline();
    inner.state.send_replace(ConnectionState::Disconnected);
    tracing::debug!("sync client stopped");
}

fn send_event(tx: &mpsc::UnboundedSender<String>, event: &ClientEvent) {
    match serde_json::to_string(event) {
        Ok(frame) => {
            if tx.send(frame).is_err() {
                tracing::debug!(event = event.name(), "link closed, frame dropped");
            }
        }
        Err(e) => tracing::warn!(error = %e, event = event.name(), "failed to encode frame"),
    }
}
