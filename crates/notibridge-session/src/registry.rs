//! Registry of device sessions.
//!
//! Owns one session per enabled device, the shared filter rule set, and
//! the event broadcast every session publishes on. Device records and
//! rules are written through to the host-supplied stores.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{RwLock, broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{info, warn};

use notibridge_core::config::Config;
use notibridge_core::filter::{FilterRule, RuleSet, RuleUpdate};
use notibridge_core::protocol::Response;
use notibridge_core::{Device, DeviceStore, FilterConfigStore};

use crate::auth;
use crate::error::SessionError;
use crate::events::{DeviceView, SessionEvent, SessionStatus};
use crate::reconnect::ReconnectPolicy;
use crate::session::{SessionContext, SessionHandle, spawn_session};
use crate::transport::Connector;

struct SessionEntry {
    handle: SessionHandle,
    task: JoinHandle<()>,
}

/// Thread-safe registry of device sessions.
pub struct SessionRegistry<C: Connector> {
    connector: Arc<C>,
    devices: Arc<dyn DeviceStore>,
    filters: Arc<dyn FilterConfigStore>,
    config: Config,
    sessions: RwLock<HashMap<String, SessionEntry>>,
    rules: watch::Sender<Arc<RuleSet>>,
    events: broadcast::Sender<SessionEvent>,
}

impl<C: Connector> SessionRegistry<C> {
    /// Build a registry, loading filter rules from `filters` (defaults when
    /// nothing was saved yet). No session is started until [`start`](Self::start).
    pub fn new(
        connector: C,
        devices: Arc<dyn DeviceStore>,
        filters: Arc<dyn FilterConfigStore>,
        config: Config,
    ) -> Result<Self, SessionError> {
        let stored = filters.load()?;
        let rules = if stored.is_empty() {
            RuleSet::new()
        } else {
            RuleSet::from_rules(stored)
        };
        let (rules, _) = watch::channel(Arc::new(rules));
        let (events, _) = broadcast::channel(config.session.event_capacity.max(1));

        Ok(Self {
            connector: Arc::new(connector),
            devices,
            filters,
            config,
            sessions: RwLock::new(HashMap::new()),
            rules,
            events,
        })
    }

    /// Start sessions for every enabled device in the store.
    ///
    /// Devices without a token get an idle session and are reported but not
    /// connected. Returns the number of sessions started.
    pub async fn start(&self) -> Result<usize, SessionError> {
        let mut started = 0;
        for device in self.devices.load()? {
            if !device.enabled {
                continue;
            }
            self.spawn(device, true).await;
            started += 1;
        }
        info!(started, "Session registry started");
        Ok(started)
    }

    fn context(&self) -> SessionContext<C> {
        SessionContext {
            connector: Arc::clone(&self.connector),
            store: Arc::clone(&self.devices),
            rules: self.rules.subscribe(),
            events: self.events.clone(),
            config: self.config.session.clone(),
            policy: ReconnectPolicy::from(&self.config.reconnect),
        }
    }

    /// Spawn a session for `device`, replacing any existing one. With
    /// `connect`, start connecting when the device holds a token.
    async fn spawn(&self, device: Device, connect: bool) -> SessionHandle {
        let uuid = device.uuid.clone();
        let has_token = device.has_token();
        self.stop_session(&uuid).await;

        let (handle, task) = spawn_session(device, self.context());
        self.sessions.write().await.insert(
            uuid.clone(),
            SessionEntry {
                handle: handle.clone(),
                task,
            },
        );

        if !connect {
            return handle;
        }
        if has_token {
            if let Err(e) = handle.connect().await {
                warn!(device = %uuid, error = %e, "Session did not start connecting");
            }
        } else {
            warn!(device = %uuid, "Device has no token; waiting for pairing");
        }
        handle
    }

    async fn stop_session(&self, uuid: &str) -> bool {
        let entry = self.sessions.write().await.remove(uuid);
        match entry {
            Some(entry) => {
                stop(entry).await;
                true
            }
            None => false,
        }
    }

    fn find_device(&self, uuid: &str) -> Result<Device, SessionError> {
        self.devices
            .load()?
            .into_iter()
            .find(|d| d.uuid == uuid)
            .ok_or_else(|| SessionError::DeviceNotFound(uuid.to_string()))
    }

    /// Add or replace a device.
    ///
    /// A device with the same uuid is replaced in place (keeping its
    /// creation time); a different device on the same endpoint is removed
    /// first. Enabled devices are started immediately.
    pub async fn add_device(&self, mut device: Device) -> Result<(), SessionError> {
        for existing in self.devices.load()? {
            if existing.uuid == device.uuid {
                device.created_at = existing.created_at;
            } else if existing.endpoint == device.endpoint {
                info!(
                    old = %existing.uuid,
                    new = %device.uuid,
                    endpoint = %device.endpoint,
                    "Replacing device registered on the same endpoint"
                );
                self.remove_device(&existing.uuid).await?;
            }
        }

        self.stop_session(&device.uuid).await;
        self.devices.save(&device)?;
        info!(device = %device.uuid, hostname = %device.hostname, "Device saved");
        let _ = self.events.send(SessionEvent::DeviceUpdated(device.clone()));

        if device.enabled {
            self.spawn(device, true).await;
        }
        Ok(())
    }

    /// Remove a device, stopping its session and cancelling its requests.
    pub async fn remove_device(&self, uuid: &str) -> Result<(), SessionError> {
        let had_session = self.stop_session(uuid).await;
        let known = self.devices.load()?.iter().any(|d| d.uuid == uuid);
        if !known && !had_session {
            return Err(SessionError::DeviceNotFound(uuid.to_string()));
        }
        self.devices.delete(uuid)?;
        info!(device = %uuid, "Device removed");
        let _ = self.events.send(SessionEvent::DeviceRemoved {
            device: uuid.to_string(),
        });
        Ok(())
    }

    /// Enable (start and connect) or disable (stop) a device.
    pub async fn set_enabled(&self, uuid: &str, enabled: bool) -> Result<(), SessionError> {
        let mut device = self.find_device(uuid)?;
        if !enabled {
            self.stop_session(uuid).await;
        }
        device.enabled = enabled;
        self.devices.save(&device)?;
        info!(device = %uuid, enabled, "Device toggled");
        let _ = self.events.send(SessionEvent::DeviceUpdated(device.clone()));

        if enabled {
            match self.handle(uuid).await {
                Some(handle) => handle.manual_reconnect().await?,
                None => {
                    self.spawn(device, true).await;
                }
            }
        }
        Ok(())
    }

    /// Reset backoff and connect now.
    pub async fn reconnect(&self, uuid: &str) -> Result<(), SessionError> {
        if let Some(handle) = self.handle(uuid).await {
            return handle.manual_reconnect().await;
        }
        let device = self.find_device(uuid)?;
        if !device.enabled {
            return Err(SessionError::NotConnected(uuid.to_string()));
        }
        self.spawn(device, false).await.manual_reconnect().await
    }

    /// Disconnect and suppress automatic reconnects until the next
    /// [`reconnect`](Self::reconnect).
    pub async fn disconnect(&self, uuid: &str) -> Result<(), SessionError> {
        self.require_handle(uuid).await?.disconnect().await
    }

    /// Store a new token and hand it to the running session.
    pub async fn update_token(&self, uuid: &str, token: Option<String>) -> Result<(), SessionError> {
        let mut device = self.find_device(uuid)?;
        device.token.clone_from(&token);
        self.devices.save(&device)?;
        let _ = self.events.send(SessionEvent::DeviceUpdated(device));
        if let Some(handle) = self.handle(uuid).await {
            handle.update_token(token).await?;
        }
        Ok(())
    }

    /// Pair with a device: ask it for a token over a short-lived connection.
    pub async fn request_token(&self, endpoint: &str) -> Result<String, SessionError> {
        auth::request_token(self.connector.as_ref(), endpoint, &self.config.session).await
    }

    pub fn devices(&self) -> Result<Vec<Device>, SessionError> {
        Ok(self.devices.load()?)
    }

    pub async fn handle(&self, uuid: &str) -> Option<SessionHandle> {
        self.sessions
            .read()
            .await
            .get(uuid)
            .map(|entry| entry.handle.clone())
    }

    async fn require_handle(&self, uuid: &str) -> Result<SessionHandle, SessionError> {
        if let Some(handle) = self.handle(uuid).await {
            return Ok(handle);
        }
        self.find_device(uuid)?;
        Err(SessionError::NotConnected(uuid.to_string()))
    }

    pub async fn status(&self, uuid: &str) -> Option<SessionStatus> {
        self.handle(uuid).await.map(|h| h.status())
    }

    pub async fn view(&self, uuid: &str) -> Option<Arc<DeviceView>> {
        self.handle(uuid).await.map(|h| h.view())
    }

    /// Views of every running session.
    pub async fn views(&self) -> Vec<Arc<DeviceView>> {
        self.sessions
            .read()
            .await
            .values()
            .map(|entry| entry.handle.view())
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Current rule set.
    pub fn rules(&self) -> Arc<RuleSet> {
        Arc::clone(&self.rules.borrow())
    }

    /// Apply a partial update to one rule, persist it, and re-filter every
    /// device. Returns whether anything changed.
    pub fn update_rule(&self, id: &str, update: &RuleUpdate) -> Result<bool, SessionError> {
        let mut result = Ok(false);
        self.rules.send_if_modified(|current| {
            let mut next = (**current).clone();
            if !next.apply(id, update) {
                return false;
            }
            if let Err(e) = self.filters.save(next.rules()) {
                result = Err(e.into());
                return false;
            }
            *current = Arc::new(next);
            result = Ok(true);
            true
        });
        if matches!(result, Ok(true)) {
            info!(rule_id = id, "Filter rule updated");
        }
        result
    }

    /// Replace the whole rule list, persist it, and re-filter every device.
    pub fn set_rules(&self, rules: Vec<FilterRule>) -> Result<(), SessionError> {
        let mut result = Ok(());
        self.rules.send_if_modified(|current| {
            let next = current.replaced(rules);
            match self.filters.save(next.rules()) {
                Ok(()) => {
                    *current = Arc::new(next);
                    true
                }
                Err(e) => {
                    result = Err(e.into());
                    false
                }
            }
        });
        if result.is_ok() {
            info!("Filter rules replaced");
        }
        result
    }

    /// Send a correlated request to a connected device.
    pub async fn request(
        &self,
        uuid: &str,
        action: &str,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<Response, SessionError> {
        self.require_handle(uuid)
            .await?
            .request(action, payload, timeout)
            .await
    }

    pub async fn mark_read(&self, uuid: &str, ids: Vec<String>) -> Result<bool, SessionError> {
        self.require_handle(uuid).await?.mark_read(ids).await
    }

    pub async fn delete_notification(&self, uuid: &str, id: &str) -> Result<bool, SessionError> {
        self.require_handle(uuid).await?.delete(id).await
    }

    pub async fn clear_notifications(&self, uuid: &str) -> Result<bool, SessionError> {
        self.require_handle(uuid).await?.clear().await
    }

    /// Stop every session.
    pub async fn shutdown(&self) {
        let entries: Vec<_> = self.sessions.write().await.drain().map(|(_, e)| e).collect();
        info!(count = entries.len(), "Shutting down sessions");
        for entry in entries {
            stop(entry).await;
        }
    }
}

async fn stop(entry: SessionEntry) {
    entry.handle.shutdown().await;
    if let Err(e) = entry.task.await {
        warn!(device = %entry.handle.device(), error = %e, "Session task ended abnormally");
    }
}
