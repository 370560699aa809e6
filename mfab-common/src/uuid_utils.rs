//! UUID utilities

use uuid::Uuid;

/// Generate a new UUIDv4
pub fn generate() -> Uuid {
    Uuid::new_v4()
}

/// Parse UUID from string
pub fn parse(s: &str) -> Result<Uuid, uuid::Error> {
    Uuid::parse_str(s)
}

/// First eight hex characters of a UUID, for log lines and storage keys
pub fn short(id: &Uuid) -> String {
    id.simple().to_string()[..8].to_string()
}
