//! Device session registry.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Local};
use parking_lot::RwLock;

use super::connection::{Connection, ConnectionId};
use crate::error::{AppError, Result};

/// Live association between a device and its connection.
#[derive(Debug, Clone)]
pub struct DeviceSession {
    pub device_id: u8,
    pub connection: Arc<Connection>,
    pub registered_at: DateTime<Local>,
}

/// Point-in-time view of one session, for diagnostics.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub device_id: u8,
    pub connection_id: ConnectionId,
    pub peer: SocketAddr,
    pub registered_at: DateTime<Local>,
    pub active: bool,
}

#[derive(Default)]
struct Sessions {
    by_device: HashMap<u8, DeviceSession>,
    /// Last device id each connection registered under
    by_connection: HashMap<ConnectionId, u8>,
}

/// Concurrency-safe mapping from device id to its live connection.
///
/// Last registration wins: binding an id that is already mapped replaces the
/// old connection, and a stale connection closing later does not evict the
/// newer mapping.
#[derive(Default)]
pub struct SessionRegistry {
    inner: RwLock<Sessions>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate `device_id` with `connection`.
    ///
    /// Returns the connection this binding superseded, if it was a different one.
    pub fn bind(&self, device_id: u8, connection: Arc<Connection>) -> Option<Arc<Connection>> {
        let conn_id = connection.id();
        let mut sessions = self.inner.write();

        // A connection re-registering under another id gives up the old one
        if let Some(prev_id) = sessions.by_connection.insert(conn_id, device_id) {
            let owned = sessions
                .by_device
                .get(&prev_id)
                .is_some_and(|s| s.connection.id() == conn_id);
            if prev_id != device_id && owned {
                sessions.by_device.remove(&prev_id);
            }
        }

        let session = DeviceSession {
            device_id,
            connection,
            registered_at: Local::now(),
        };

        sessions
            .by_device
            .insert(device_id, session)
            .map(|old| old.connection)
            .filter(|old| old.id() != conn_id)
    }

    /// Remove the mapping that points at exactly this connection.
    ///
    /// Returns the device id that was unbound, if any.
    pub fn unbind(&self, connection: &Connection) -> Option<u8> {
        let conn_id = connection.id();
        let mut sessions = self.inner.write();

        let device_id = sessions.by_connection.remove(&conn_id)?;
        let owns_mapping = sessions
            .by_device
            .get(&device_id)
            .is_some_and(|s| s.connection.id() == conn_id);

        if owns_mapping {
            sessions.by_device.remove(&device_id);
            Some(device_id)
        } else {
            None
        }
    }

    /// Current connection for a device, active or not.
    pub fn get(&self, device_id: u8) -> Option<Arc<Connection>> {
        self.inner
            .read()
            .by_device
            .get(&device_id)
            .map(|s| Arc::clone(&s.connection))
    }

    /// Current connection for a device, or `DeviceOffline` when there is no
    /// session or its connection is inactive.
    pub fn active(&self, device_id: u8) -> Result<Arc<Connection>> {
        self.get(device_id)
            .filter(|conn| conn.is_active())
            .ok_or(AppError::DeviceOffline(device_id))
    }

    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let sessions = self.inner.read();
        let mut out: Vec<SessionInfo> = sessions
            .by_device
            .values()
            .map(|s| SessionInfo {
                device_id: s.device_id,
                connection_id: s.connection.id(),
                peer: s.connection.peer(),
                registered_at: s.registered_at,
                active: s.connection.is_active(),
            })
            .collect();
        out.sort_by_key(|s| s.device_id);
        out
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_device.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
