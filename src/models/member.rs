use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Community member as seen by the tournament engine.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq, Eq)]
pub struct Member {
    pub id: Uuid,
    pub discord_id: i64,
    pub username: String,
    /// IANA zone name chosen by the member, e.g. `Europe/Berlin`.
    pub timezone: Option<String>,
    /// ISO 3166 alpha-2 code, used when no zone was chosen.
    pub country_code: Option<String>,
}
