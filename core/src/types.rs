//! Shared primitive types used across the whole engine.

use chrono::{DateTime, Utc};

/// Money in minor currency units (CRC has no practical minor unit, so
/// one unit is one colón).
pub type Amount = i64;

/// Authenticated user identifier supplied by the identity provider.
pub type UserId = String;

/// A stable, unique identifier for any stored entity.
pub type EntityId = String;

pub type Timestamp = DateTime<Utc>;

/// The only currency this deployment handles.
pub const CURRENCY: &str = "CRC";

pub fn new_entity_id() -> EntityId {
    uuid::Uuid::new_v4().to_string()
}
