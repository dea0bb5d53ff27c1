use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

fn default_max_players() -> u32 {
    20
}

/// Registration payload a running game server posts to the matchmaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerAnnouncement {
    /// Address the server is reachable at.
    pub ip: String,
    /// Published port.
    pub port: u16,
    /// Room display name.
    pub name: String,
    /// Player ceiling.
    #[serde(default = "default_max_players")]
    pub max_players: u32,
    /// Players currently connected.
    #[serde(default)]
    pub current_players: u32,
    /// Free-form extra data.
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// A registered server as stored by the matchmaker. Keyed by
/// `"<ip>:<port>"`; re-registration updates in place.
#[derive(Debug, Clone)]
pub struct ServerRecord {
    /// Primary key, `"<ip>:<port>"`.
    pub server_id: String,
    /// Address.
    pub ip: String,
    /// Port.
    pub port: u16,
    /// Room display name.
    pub name: String,
    /// Player ceiling.
    pub max_players: u32,
    /// Players currently connected.
    pub current_players: u32,
    /// Free-form extra data.
    pub metadata: Map<String, Value>,
    /// First registration time; preserved across re-registrations.
    pub registered_at: DateTime<Utc>,
    /// Most recent heartbeat or registration time.
    pub last_heartbeat: DateTime<Utc>,
}

impl ServerRecord {
    /// Derive the store key for an address pair.
    pub fn server_id_for(ip: &str, port: u16) -> String {
        format!("{ip}:{port}")
    }

    /// Project this record into the annotated wire shape at `now`.
    pub fn annotate(&self, now: DateTime<Utc>) -> ServerInfo {
        ServerInfo {
            server_id: self.server_id.clone(),
            ip: self.ip.clone(),
            port: self.port,
            name: self.name.clone(),
            max_players: self.max_players,
            current_players: self.current_players,
            metadata: self.metadata.clone(),
            last_heartbeat: self.last_heartbeat.to_rfc3339(),
            uptime: (now - self.registered_at).num_seconds().max(0),
        }
    }
}

/// Annotated projection of a registered server, as returned by the
/// matchmaker's query endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    /// Primary key, `"<ip>:<port>"`.
    pub server_id: String,
    /// Address.
    pub ip: String,
    /// Port.
    pub port: u16,
    /// Room display name.
    pub name: String,
    /// Player ceiling.
    pub max_players: u32,
    /// Players currently connected.
    pub current_players: u32,
    /// Free-form extra data.
    pub metadata: Map<String, Value>,
    /// ISO-8601 timestamp of the latest heartbeat.
    pub last_heartbeat: String,
    /// Whole seconds since first registration.
    pub uptime: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_id_is_ip_port() {
        assert_eq!(
            ServerRecord::server_id_for("192.168.1.10", 8081),
            "192.168.1.10:8081"
        );
    }

    #[test]
    fn announcement_defaults() {
        let parsed: ServerAnnouncement =
            serde_json::from_str(r#"{"ip":"10.0.0.1","port":9000,"name":"R"}"#).unwrap();
        assert_eq!(parsed.max_players, 20);
        assert_eq!(parsed.current_players, 0);
        assert!(parsed.metadata.is_empty());
    }
}
