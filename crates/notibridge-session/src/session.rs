//! Per-device session actor.
//!
//! Each device runs in its own task, the only writer of that device's
//! transport, pending requests, backoff timer and notification set.
//! Callers talk to it through a [`SessionHandle`]. Status and notification
//! views are published on watch channels and mirrored onto the
//! registry-wide event broadcast.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Sleep;
use tracing::{debug, error, info, warn};

use notibridge_core::config::SessionConfig;
use notibridge_core::filter::{self, RuleSet};
use notibridge_core::model::unix_timestamp_ms;
use notibridge_core::protocol::{Inbound, Push, Response, parse_frame};
use notibridge_core::{Device, DeviceStore, NotificationSet};

use crate::auth::{LoginOutcome, duration_ms, login};
use crate::correlator::RequestCorrelator;
use crate::error::{AuthError, SessionError, TransportError};
use crate::events::{ConnectionState, DeviceView, SessionEvent, SessionStatus};
use crate::reconnect::ReconnectPolicy;
use crate::transport::{CloseReason, Connector, TransportEvent, TransportSession, new_transport_id};

const COMMAND_CAPACITY: usize = 32;

/// Push frames held while login is in flight.
const MAX_HELD_PUSHES: usize = 1024;

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

pub(crate) enum Command {
    Connect(Reply<()>),
    Disconnect(Reply<()>),
    Reconnect(Reply<()>),
    UpdateToken(Option<String>, Reply<()>),
    Request {
        action: String,
        payload: Value,
        timeout: Option<Duration>,
        reply: Reply<Response>,
    },
    MarkRead(Vec<String>, Reply<bool>),
    Delete(String, Reply<bool>),
    Clear(Reply<bool>),
    Shutdown,
}

/// Shared collaborators handed to every session.
pub(crate) struct SessionContext<C> {
    pub connector: Arc<C>,
    pub store: Arc<dyn DeviceStore>,
    pub rules: watch::Receiver<Arc<RuleSet>>,
    pub events: broadcast::Sender<SessionEvent>,
    pub config: SessionConfig,
    pub policy: ReconnectPolicy,
}

/// Handle to a running device session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    device: String,
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<SessionStatus>,
    view: watch::Receiver<Arc<DeviceView>>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Connect(_) => "Connect",
            Self::Disconnect(_) => "Disconnect",
            Self::Reconnect(_) => "Reconnect",
            Self::UpdateToken(..) => "UpdateToken",
            Self::Request { .. } => "Request",
            Self::MarkRead(..) => "MarkRead",
            Self::Delete(..) => "Delete",
            Self::Clear(_) => "Clear",
            Self::Shutdown => "Shutdown",
        };
        f.write_str(name)
    }
}

impl SessionHandle {
    /// Uuid of the device this session serves.
    pub fn device(&self) -> &str {
        &self.device
    }

    fn closed(&self) -> SessionError {
        SessionError::SessionClosed(self.device.clone())
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| self.closed())?;
        rx.await.map_err(|_| self.closed())?
    }

    /// Start connecting. No-op while already connecting or connected.
    pub async fn connect(&self) -> Result<(), SessionError> {
        self.call(Command::Connect).await
    }

    /// Close the connection and suppress automatic reconnects.
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        self.call(Command::Disconnect).await
    }

    /// Reset backoff, drop any current connection, and connect now.
    pub async fn manual_reconnect(&self) -> Result<(), SessionError> {
        self.call(Command::Reconnect).await
    }

    /// Replace the token used by subsequent logins.
    pub async fn update_token(&self, token: Option<String>) -> Result<(), SessionError> {
        self.call(|reply| Command::UpdateToken(token, reply)).await
    }

    /// Send a correlated request over the live connection.
    ///
    /// `timeout` defaults to the configured request timeout.
    pub async fn request(
        &self,
        action: impl Into<String>,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<Response, SessionError> {
        let action = action.into();
        self.call(|reply| Command::Request {
            action,
            payload,
            timeout,
            reply,
        })
        .await
    }

    pub async fn mark_read(&self, ids: Vec<String>) -> Result<bool, SessionError> {
        self.call(|reply| Command::MarkRead(ids, reply)).await
    }

    /// Remove every local entry with this id.
    pub async fn delete(&self, id: impl Into<String>) -> Result<bool, SessionError> {
        let id = id.into();
        self.call(|reply| Command::Delete(id, reply)).await
    }

    pub async fn clear(&self) -> Result<bool, SessionError> {
        self.call(Command::Clear).await
    }

    /// Ask the session task to stop.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    pub fn view(&self) -> Arc<DeviceView> {
        Arc::clone(&self.view.borrow())
    }

    pub fn watch_view(&self) -> watch::Receiver<Arc<DeviceView>> {
        self.view.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }
}

/// Start the session task for `device`. The session stays idle until told
/// to connect.
pub(crate) fn spawn_session<C: Connector>(
    device: Device,
    ctx: SessionContext<C>,
) -> (SessionHandle, JoinHandle<()>) {
    let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
    let (status_tx, status_rx) = watch::channel(SessionStatus::default());
    let (view_tx, view_rx) = watch::channel(Arc::new(DeviceView {
        device: device.uuid.clone(),
        ..DeviceView::default()
    }));

    let handle = SessionHandle {
        device: device.uuid.clone(),
        commands: command_tx,
        status: status_rx,
        view: view_rx,
    };

    let session = DeviceSession {
        correlator: Arc::new(RequestCorrelator::new(
            format!("socket_{}", new_transport_id()),
            ctx.config.approval_timeout(),
        )),
        device,
        connector: ctx.connector,
        store: ctx.store,
        config: ctx.config,
        policy: ctx.policy,
        commands: command_rx,
        rules: ctx.rules,
        events: ctx.events,
        status_tx,
        view_tx,
        transport: None,
        connecting: None,
        login: None,
        retry: None,
        held: Vec::new(),
        notifications: NotificationSet::new(),
        attempt: 0,
        manual_disconnect: false,
    };
    let task = tokio::spawn(session.run());
    (handle, task)
}

#[derive(Debug, Clone, Copy)]
enum Failure {
    Transport,
    Auth,
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport => f.write_str("transport"),
            Self::Auth => f.write_str("auth"),
        }
    }
}

struct DeviceSession<C> {
    device: Device,
    connector: Arc<C>,
    store: Arc<dyn DeviceStore>,
    config: SessionConfig,
    policy: ReconnectPolicy,
    commands: mpsc::Receiver<Command>,
    rules: watch::Receiver<Arc<RuleSet>>,
    events: broadcast::Sender<SessionEvent>,
    status_tx: watch::Sender<SessionStatus>,
    view_tx: watch::Sender<Arc<DeviceView>>,
    correlator: Arc<RequestCorrelator>,
    transport: Option<TransportSession>,
    connecting: Option<JoinHandle<Result<TransportSession, TransportError>>>,
    login: Option<JoinHandle<Result<LoginOutcome, AuthError>>>,
    retry: Option<Pin<Box<Sleep>>>,
    held: Vec<Push>,
    notifications: NotificationSet,
    attempt: u32,
    manual_disconnect: bool,
}

/// Await the future in `slot`, or pend forever when it is empty.
async fn wait_opt<F: Future + Unpin>(slot: &mut Option<F>) -> F::Output {
    match slot.as_mut() {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

async fn recv_opt(slot: &mut Option<TransportSession>) -> Option<TransportEvent> {
    match slot.as_mut() {
        Some(transport) => transport.recv().await,
        None => std::future::pending().await,
    }
}

impl<C: Connector> DeviceSession<C> {
    async fn run(mut self) {
        info!(device = %self.device.uuid, endpoint = %self.device.endpoint, "Session started");

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                result = wait_opt(&mut self.connecting) => {
                    self.connecting = None;
                    self.on_transport_open(result);
                }
                result = wait_opt(&mut self.login) => {
                    self.login = None;
                    self.on_login(result);
                }
                event = recv_opt(&mut self.transport) => self.on_transport_event(event),
                () = wait_opt(&mut self.retry) => {
                    self.retry = None;
                    self.on_retry_timer();
                }
                changed = self.rules.changed() => {
                    if changed.is_err() {
                        debug!(device = %self.device.uuid, "Rule owner dropped");
                        break;
                    }
                    self.publish_view();
                }
            }
        }

        self.retry = None;
        self.teardown_link();
        self.update_status(|s| {
            s.state = ConnectionState::Disconnected;
            s.retry_in_ms = None;
        });
        info!(device = %self.device.uuid, "Session stopped");
    }

    fn state(&self) -> ConnectionState {
        self.status_tx.borrow().state
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect(reply) => {
                let _ = reply.send(self.connect());
            }
            Command::Disconnect(reply) => {
                self.disconnect();
                let _ = reply.send(Ok(()));
            }
            Command::Reconnect(reply) => {
                let _ = reply.send(self.manual_reconnect());
            }
            Command::UpdateToken(token, reply) => {
                debug!(device = %self.device.uuid, has_token = token.is_some(), "Token updated");
                self.device.token = token;
                let _ = reply.send(Ok(()));
            }
            Command::Request {
                action,
                payload,
                timeout,
                reply,
            } => self.request(action, payload, timeout, reply),
            Command::MarkRead(ids, reply) => {
                let changed = self.notifications.mark_read(&ids);
                self.reply_local(changed, reply);
            }
            Command::Delete(id, reply) => {
                let changed = self.notifications.delete(&id);
                self.reply_local(changed, reply);
            }
            Command::Clear(reply) => {
                let changed = self.notifications.clear();
                self.reply_local(changed, reply);
            }
            Command::Shutdown => {}
        }
    }

    fn reply_local(&self, changed: bool, reply: Reply<bool>) {
        if changed {
            self.publish_view();
        }
        let _ = reply.send(Ok(changed));
    }

    fn require_token(&self) -> Result<(), SessionError> {
        if self.device.has_token() {
            return Ok(());
        }
        let err = AuthError::MissingToken;
        warn!(device = %self.device.uuid, "Cannot connect: {err}");
        let message = err.to_string();
        self.update_status(|s| {
            if s.state == ConnectionState::Idle {
                s.state = ConnectionState::Disconnected;
            }
            s.last_error = Some(message);
        });
        Err(err.into())
    }

    fn connect(&mut self) -> Result<(), SessionError> {
        match self.state() {
            state if state.is_active() => return Ok(()),
            ConnectionState::Failed => {
                return Err(SessionError::MaxAttemptsExceeded(self.device.uuid.clone()));
            }
            _ => {}
        }
        self.require_token()?;
        self.manual_disconnect = false;
        self.retry = None;
        self.start_connect();
        Ok(())
    }

    fn manual_reconnect(&mut self) -> Result<(), SessionError> {
        self.require_token()?;
        info!(device = %self.device.uuid, "Manual reconnect");
        self.attempt = 0;
        self.manual_disconnect = false;
        self.retry = None;
        self.teardown_link();
        self.start_connect();
        Ok(())
    }

    fn disconnect(&mut self) {
        info!(device = %self.device.uuid, "Manual disconnect");
        self.manual_disconnect = true;
        self.retry = None;
        self.teardown_link();
        // Failed only clears through manual_reconnect.
        if self.state() == ConnectionState::Failed {
            self.update_status(|s| s.retry_in_ms = None);
            return;
        }
        self.update_status(|s| {
            s.state = ConnectionState::Disconnected;
            s.last_error = None;
            s.retry_in_ms = None;
        });
    }

    fn start_connect(&mut self) {
        let connector = Arc::clone(&self.connector);
        let endpoint = self.device.endpoint.clone();
        let limit = self.config.connect_timeout();
        debug!(device = %self.device.uuid, %endpoint, attempt = self.attempt, "Connecting");

        self.connecting = Some(tokio::spawn(async move {
            tokio::time::timeout(limit, connector.connect(&endpoint))
                .await
                .unwrap_or(Err(TransportError::ConnectTimeout(duration_ms(limit))))
        }));
        self.update_status(|s| {
            s.state = ConnectionState::Connecting;
            s.retry_in_ms = None;
        });
    }

    fn on_transport_open(&mut self, result: Result<Result<TransportSession, TransportError>, JoinError>) {
        let transport = match result {
            Ok(Ok(transport)) => transport,
            Ok(Err(e)) => return self.on_failure(Failure::Transport, e.to_string()),
            Err(e) => {
                error!(device = %self.device.uuid, error = %e, "Connect task failed");
                return self.on_failure(Failure::Transport, e.to_string());
            }
        };

        info!(device = %self.device.uuid, transport = %transport.id(), "Transport open, logging in");
        let sender = transport.sender();
        self.transport = Some(transport);

        let correlator = Arc::clone(&self.correlator);
        let token = self.device.token.clone();
        let timeout = self.config.request_timeout();
        self.login = Some(tokio::spawn(async move {
            login(&correlator, &sender, token.as_deref(), timeout).await
        }));
        self.update_status(|s| s.state = ConnectionState::Authenticating);
    }

    fn on_login(&mut self, result: Result<Result<LoginOutcome, AuthError>, JoinError>) {
        match result {
            Ok(Ok(outcome)) => self.on_authenticated(outcome),
            Ok(Err(AuthError::MissingToken)) => {
                self.teardown_link();
                let message = AuthError::MissingToken.to_string();
                self.update_status(|s| {
                    s.state = ConnectionState::Disconnected;
                    s.last_error = Some(message);
                });
            }
            Ok(Err(e)) => {
                self.teardown_link();
                let kind = if e.is_transport() {
                    Failure::Transport
                } else {
                    Failure::Auth
                };
                self.on_failure(kind, e.to_string());
            }
            Err(e) => {
                error!(device = %self.device.uuid, error = %e, "Login task failed");
                self.teardown_link();
                self.on_failure(Failure::Transport, e.to_string());
            }
        }
    }

    fn on_authenticated(&mut self, outcome: LoginOutcome) {
        self.attempt = 0;
        if let Some(token) = outcome.refreshed_token {
            info!(device = %self.device.uuid, "Device issued a refreshed token");
            self.device.token = Some(token);
        }
        self.device.last_used_at = unix_timestamp_ms();
        if let Err(e) = self.store.save(&self.device) {
            warn!(device = %self.device.uuid, error = %e, "Failed to persist device after login");
        }
        let _ = self.events.send(SessionEvent::DeviceUpdated(self.device.clone()));

        self.update_status(|s| {
            s.state = ConnectionState::Connected;
            s.last_error = None;
            s.retry_in_ms = None;
        });

        let held = std::mem::take(&mut self.held);
        let mut changed = false;
        for push in held {
            changed |= self.apply_push(push);
        }
        if changed {
            self.publish_view();
        }
    }

    fn on_transport_event(&mut self, event: Option<TransportEvent>) {
        let reason = match event {
            Some(TransportEvent::Frame(text)) => return self.on_frame(&text),
            Some(TransportEvent::Closed(reason)) => reason,
            None => CloseReason::Dropped,
        };
        self.transport = None;
        warn!(device = %self.device.uuid, %reason, "Connection lost");
        self.teardown_link();
        self.on_failure(Failure::Transport, reason.to_string());
    }

    fn on_frame(&mut self, text: &str) {
        match parse_frame(text) {
            Ok(Inbound::Response(response)) => {
                self.correlator.complete(response);
            }
            Ok(Inbound::Push(push)) => match self.state() {
                ConnectionState::Connected => {
                    if self.apply_push(push) {
                        self.publish_view();
                    }
                }
                ConnectionState::Authenticating if self.held.len() < MAX_HELD_PUSHES => {
                    self.held.push(push);
                }
                state => {
                    warn!(device = %self.device.uuid, %state, "Dropping push frame");
                }
            },
            Ok(Inbound::Unknown { frame_type, .. }) => {
                debug!(device = %self.device.uuid, frame_type, "Ignoring unknown frame type");
            }
            Err(e) => {
                warn!(device = %self.device.uuid, error = %e, "Dropping malformed frame");
            }
        }
    }

    fn apply_push(&mut self, push: Push) -> bool {
        match push {
            Push::Initial(batch) => self.notifications.apply_init(batch),
            Push::Notification(event) => self.notifications.apply_event(event),
        }
    }

    /// Route a failure into backoff, or into `Failed` once attempts run out.
    fn on_failure(&mut self, kind: Failure, message: String) {
        if self.manual_disconnect {
            self.update_status(|s| {
                s.state = ConnectionState::Disconnected;
                s.last_error = Some(message);
                s.retry_in_ms = None;
            });
            return;
        }

        if !self.policy.should_retry(self.attempt) {
            error!(
                device = %self.device.uuid,
                %kind,
                attempts = self.attempt,
                error = %message,
                "Reconnect attempts exhausted"
            );
            self.update_status(|s| {
                s.state = ConnectionState::Failed;
                s.last_error = Some(message);
                s.retry_in_ms = None;
            });
            return;
        }

        let delay = self.policy.delay_for_attempt(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        warn!(
            device = %self.device.uuid,
            %kind,
            error = %message,
            attempt = self.attempt,
            delay_ms = duration_ms(delay),
            "Reconnecting"
        );
        self.retry = Some(Box::pin(tokio::time::sleep(delay)));
        self.update_status(|s| {
            s.state = ConnectionState::Disconnected;
            s.last_error = Some(message);
            s.retry_in_ms = Some(duration_ms(delay));
        });
    }

    fn on_retry_timer(&mut self) {
        if self.manual_disconnect || self.state().is_active() {
            return;
        }
        if self.require_token().is_err() {
            return;
        }
        self.start_connect();
    }

    /// Drop the transport and everything riding on it.
    fn teardown_link(&mut self) {
        if let Some(task) = self.connecting.take() {
            task.abort();
        }
        if let Some(task) = self.login.take() {
            task.abort();
        }
        if let Some(transport) = self.transport.take() {
            transport.close();
        }
        self.correlator.fail_all();
        if !self.held.is_empty() {
            debug!(device = %self.device.uuid, count = self.held.len(), "Discarding held push frames");
            self.held.clear();
        }
    }

    fn request(
        &self,
        action: String,
        payload: Value,
        timeout: Option<Duration>,
        reply: Reply<Response>,
    ) {
        let sender = match (&self.transport, self.state()) {
            (Some(transport), ConnectionState::Connected) => transport.sender(),
            _ => {
                let _ = reply.send(Err(SessionError::NotConnected(self.device.uuid.clone())));
                return;
            }
        };
        let correlator = Arc::clone(&self.correlator);
        let timeout = timeout.unwrap_or_else(|| self.config.request_timeout());
        tokio::spawn(async move {
            let result = correlator
                .request(&sender, &action, payload, timeout)
                .await
                .map_err(SessionError::from);
            let _ = reply.send(result);
        });
    }

    /// Publish a fresh view: the set and its filtered form, filtered under
    /// the current rules.
    fn publish_view(&self) {
        let rules = Arc::clone(&self.rules.borrow());
        let notifications = self.notifications.entries().to_vec();
        let visible = filter::recompute(&notifications, &rules);
        let counts = self.notifications.counts_for(&visible);
        let view = Arc::new(DeviceView {
            device: self.device.uuid.clone(),
            notifications,
            visible,
            counts,
        });
        self.view_tx.send_replace(Arc::clone(&view));
        let _ = self.events.send(SessionEvent::ViewChanged {
            device: self.device.uuid.clone(),
            view,
        });
    }

    fn update_status(&self, update: impl FnOnce(&mut SessionStatus)) {
        let mut status = self.status_tx.borrow().clone();
        let before = status.state;
        update(&mut status);
        status.reconnect_attempt = self.attempt;
        status.manual_disconnect = self.manual_disconnect;
        if *self.status_tx.borrow() == status {
            return;
        }
        if status.state != before {
            info!(device = %self.device.uuid, from = %before, to = %status.state, "Session state changed");
        }
        self.status_tx.send_replace(status.clone());
        let _ = self.events.send(SessionEvent::StateChanged {
            device: self.device.uuid.clone(),
            status,
        });
    }
}
