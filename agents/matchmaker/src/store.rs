use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use tracing::info;

use roomforge_core::{ServerAnnouncement, ServerInfo, ServerRecord};

/// Lookup failures surfaced by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The server id was never registered (or was already evicted).
    #[error("Server not found")]
    NotFound,
    /// The server exists but its heartbeat has lapsed.
    #[error("Server is inactive")]
    Stale,
}

/// In-memory registry of game servers, keyed by `"<ip>:<port>"`.
///
/// One lock guards the whole map; every operation is a short scan or a
/// point update, so holds stay small. The reaper and the request handlers
/// contend for the same lock.
#[derive(Debug)]
pub struct ServerStore {
    servers: Mutex<HashMap<String, ServerRecord>>,
    heartbeat_timeout: Duration,
}

impl ServerStore {
    /// A store evicting entries whose heartbeat is older than
    /// `heartbeat_timeout` seconds.
    pub fn new(heartbeat_timeout: u64) -> Self {
        Self {
            servers: Mutex::new(HashMap::new()),
            heartbeat_timeout: Duration::seconds(heartbeat_timeout as i64),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, ServerRecord>> {
        self.servers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_stale(&self, record: &ServerRecord, now: DateTime<Utc>) -> bool {
        now - record.last_heartbeat > self.heartbeat_timeout
    }

    /// Insert or update a server. New entries get `registered_at = now`;
    /// both paths advance `last_heartbeat` and refresh the mutable fields.
    /// Returns the server id.
    pub fn register_or_update(&self, announcement: ServerAnnouncement) -> String {
        let server_id = ServerRecord::server_id_for(&announcement.ip, announcement.port);
        let now = Utc::now();

        let mut servers = self.lock();
        match servers.get_mut(&server_id) {
            Some(existing) => {
                existing.name = announcement.name;
                existing.max_players = announcement.max_players;
                existing.current_players = announcement.current_players;
                existing.metadata = announcement.metadata;
                existing.last_heartbeat = now;
                info!(server_id, "updated server");
            }
            None => {
                servers.insert(
                    server_id.clone(),
                    ServerRecord {
                        server_id: server_id.clone(),
                        ip: announcement.ip,
                        port: announcement.port,
                        name: announcement.name,
                        max_players: announcement.max_players,
                        current_players: announcement.current_players,
                        metadata: announcement.metadata,
                        registered_at: now,
                        last_heartbeat: now,
                    },
                );
                info!(server_id, "registered new server");
            }
        }
        server_id
    }

    /// Refresh a server's liveness, optionally updating its player count.
    pub fn heartbeat(
        &self,
        server_id: &str,
        current_players: Option<u32>,
    ) -> Result<(), StoreError> {
        let mut servers = self.lock();
        let record = servers.get_mut(server_id).ok_or(StoreError::NotFound)?;
        record.last_heartbeat = Utc::now();
        if let Some(players) = current_players {
            record.current_players = players;
        }
        Ok(())
    }

    /// All servers whose heartbeat falls within the timeout window,
    /// annotated with uptime.
    pub fn active_servers(&self) -> Vec<ServerInfo> {
        let now = Utc::now();
        self.lock()
            .values()
            .filter(|record| !self.is_stale(record, now))
            .map(|record| record.annotate(now))
            .collect()
    }

    /// One server by id; `Stale` when present but past the timeout.
    pub fn get(&self, server_id: &str) -> Result<ServerInfo, StoreError> {
        let now = Utc::now();
        let servers = self.lock();
        let record = servers.get(server_id).ok_or(StoreError::NotFound)?;
        if self.is_stale(record, now) {
            return Err(StoreError::Stale);
        }
        Ok(record.annotate(now))
    }

    /// Delete a server; returns whether it existed.
    pub fn remove(&self, server_id: &str) -> bool {
        let existed = self.lock().remove(server_id).is_some();
        if existed {
            info!(server_id, "removed server");
        }
        existed
    }

    /// Evict every stale entry; returns the count removed.
    pub fn cleanup_stale(&self) -> usize {
        let now = Utc::now();
        let mut servers = self.lock();
        let before = servers.len();
        servers.retain(|_, record| now - record.last_heartbeat <= self.heartbeat_timeout);
        before - servers.len()
    }

    /// Registered entries, active or not.
    pub fn total(&self) -> usize {
        self.lock().len()
    }

    /// Aggregate figures for the health endpoint.
    pub fn stats(&self) -> StoreStats {
        let now = Utc::now();
        let servers = self.lock();
        let total = servers.len();
        let mut active = 0;
        let mut total_players = 0u64;
        for record in servers.values() {
            if !self.is_stale(record, now) {
                active += 1;
                total_players += u64::from(record.current_players);
            }
        }
        StoreStats {
            active_servers: active,
            total_registered_servers: total,
            stale_servers: total - active,
            total_players,
        }
    }

    /// The configured staleness window, in seconds.
    pub fn heartbeat_timeout_seconds(&self) -> i64 {
        self.heartbeat_timeout.num_seconds()
    }
}

/// Aggregate store figures.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct StoreStats {
    /// Servers within the heartbeat window.
    pub active_servers: usize,
    /// All entries, live and stale.
    pub total_registered_servers: usize,
    /// Entries past the heartbeat window, not yet reaped.
    pub stale_servers: usize,
    /// Summed player count across active servers.
    pub total_players: u64,
}
