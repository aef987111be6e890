//! Domain models and the wire format (camelCase JSON).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use utoipa::ToSchema;

use crate::now_millis;

/// Per-user matching state stored alongside the vector in the index.
///
/// The payload written to the index is always this full object; any field
/// the local model does not know about is dropped on the next metadata
/// write (see [`crate::index::IndexClient::update_metadata`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MatchMetadata {
    pub user_id: String,
    #[serde(default)]
    pub seeking_match: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opt_in_timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_matched_cycle_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_match_partner_id: Option<String>,
    #[serde(default)]
    pub missed_cycles_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_opt_out_timestamp: Option<i64>,
    #[serde(default)]
    pub updated_at: i64,
}

impl MatchMetadata {
    /// Fresh metadata for a user entering the pool right now.
    pub fn new_seeker(user_id: impl Into<String>) -> Self {
        let now = now_millis();
        Self {
            user_id: user_id.into(),
            seeking_match: true,
            opt_in_timestamp: Some(now),
            last_matched_cycle_id: None,
            current_match_partner_id: None,
            missed_cycles_count: 0,
            last_opt_out_timestamp: None,
            updated_at: now,
        }
    }

    /// Normalize an untrusted external payload into metadata.
    ///
    /// Every missing or mistyped field gets its documented default instead
    /// of failing the whole record: `seekingMatch=false`,
    /// `missedCyclesCount=0`, `updatedAt=0` (epoch), optional fields `None`.
    /// The user id is always taken from the record key, never the payload.
    pub fn from_untrusted(user_id: &str, payload: &Map<String, Value>) -> Self {
        Self {
            user_id: user_id.to_string(),
            seeking_match: payload
                .get("seekingMatch")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            opt_in_timestamp: payload.get("optInTimestamp").and_then(Value::as_i64),
            last_matched_cycle_id: payload
                .get("lastMatchedCycleId")
                .and_then(Value::as_str)
                .map(str::to_string),
            current_match_partner_id: payload
                .get("currentMatchPartnerId")
                .and_then(Value::as_str)
                .map(str::to_string),
            missed_cycles_count: payload
                .get("missedCyclesCount")
                .and_then(Value::as_u64)
                .and_then(|n| u32::try_from(n).ok())
                .unwrap_or(0),
            last_opt_out_timestamp: payload.get("lastOptOutTimestamp").and_then(Value::as_i64),
            updated_at: payload.get("updatedAt").and_then(Value::as_i64).unwrap_or(0),
        }
    }

    /// Overlay a partial update, last writer wins per field, then force the
    /// user id and `updated_at` to canonical values.
    pub fn apply_patch(&mut self, patch: &MatchMetadataPatch, user_id: &str) {
        if let Some(seeking_match) = patch.seeking_match {
            self.seeking_match = seeking_match;
        }
        if let Some(ts) = patch.opt_in_timestamp {
            self.opt_in_timestamp = Some(ts);
        }
        if let Some(ref cycle_id) = patch.last_matched_cycle_id {
            self.last_matched_cycle_id = Some(cycle_id.clone());
        }
        if let Some(ref partner_id) = patch.current_match_partner_id {
            self.current_match_partner_id = Some(partner_id.clone());
        }
        if let Some(count) = patch.missed_cycles_count {
            self.missed_cycles_count = count;
        }
        if let Some(ts) = patch.last_opt_out_timestamp {
            self.last_opt_out_timestamp = Some(ts);
        }

        self.user_id = user_id.to_string();
        self.updated_at = now_millis();
    }
}

/// Partial metadata update; only present fields are applied.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MatchMetadataPatch {
    pub seeking_match: Option<bool>,
    pub opt_in_timestamp: Option<i64>,
    pub last_matched_cycle_id: Option<String>,
    pub current_match_partner_id: Option<String>,
    pub missed_cycles_count: Option<u32>,
    pub last_opt_out_timestamp: Option<i64>,
}

impl MatchMetadataPatch {
    pub fn is_empty(&self) -> bool {
        self.seeking_match.is_none()
            && self.opt_in_timestamp.is_none()
            && self.last_matched_cycle_id.is_none()
            && self.current_match_partner_id.is_none()
            && self.missed_cycles_count.is_none()
            && self.last_opt_out_timestamp.is_none()
    }

    pub fn opt_out() -> Self {
        Self {
            seeking_match: Some(false),
            last_opt_out_timestamp: Some(now_millis()),
            ..Self::default()
        }
    }
}

/// Cached trait snapshot for a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserTraits {
    pub user_id: String,
    pub traits: Vec<String>,
    pub source: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl UserTraits {
    pub fn is_stale(&self, ttl: Duration) -> bool {
        let age_millis = now_millis().saturating_sub(self.updated_at);
        age_millis as u128 > ttl.as_millis()
    }

    /// Traits joined into the single text fed to the embedding model.
    pub fn as_embedding_text(&self) -> String {
        self.traits.join(". ")
    }
}

/// Generated vector for a user, persisted into the index immediately.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserEmbedding {
    pub user_id: String,
    pub vector: Vec<f32>,
    pub dimension: usize,
    pub model: String,
    pub created_at: i64,
}

/// One row of a similarity-query response.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SimilarUser {
    pub user_id: String,
    pub score: f32,
    pub metadata: MatchMetadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vector: Option<Vec<f32>>,
}

/// One row of a fetch-by-ids response.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub user_id: String,
    pub metadata: MatchMetadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vector: Option<Vec<f32>>,
}

/// Pipeline state reported to the opt-in caller.
///
/// `Completed`/`Failed` are only returned synchronously for short-circuits;
/// a launched pipeline always reports `Processing` and reaches its terminal
/// state out of band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum OptInStatus {
    Accepted,
    Processing,
    Completed,
    Failed,
}

impl std::fmt::Display for OptInStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OptInStatus::Accepted => "accepted",
            OptInStatus::Processing => "processing",
            OptInStatus::Completed => "completed",
            OptInStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Matching state exposed by the status endpoint.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MatchingStatus {
    pub is_seeking_match: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opt_in_timestamp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_matched_cycle_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_match_partner_id: Option<String>,
    pub missed_cycles_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_opt_out_timestamp: Option<i64>,
    /// Derived: no opt-in timestamp has ever been recorded. Distinguishes
    /// "never participated" from "opted out".
    pub has_never_opted_in: bool,
}

impl MatchingStatus {
    /// Default status object for a user with no index record.
    pub fn never_opted_in() -> Self {
        Self {
            is_seeking_match: false,
            opt_in_timestamp: None,
            last_matched_cycle_id: None,
            current_match_partner_id: None,
            missed_cycles_count: 0,
            last_opt_out_timestamp: None,
            has_never_opted_in: true,
        }
    }
}

impl From<&MatchMetadata> for MatchingStatus {
    fn from(metadata: &MatchMetadata) -> Self {
        Self {
            is_seeking_match: metadata.seeking_match,
            opt_in_timestamp: metadata.opt_in_timestamp,
            last_matched_cycle_id: metadata.last_matched_cycle_id.clone(),
            current_match_partner_id: metadata.current_match_partner_id.clone(),
            missed_cycles_count: metadata.missed_cycles_count,
            last_opt_out_timestamp: metadata.last_opt_out_timestamp,
            has_never_opted_in: metadata.opt_in_timestamp.is_none(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: Value) -> Map<String, Value> {
        value.as_object().cloned().expect("object payload")
    }

    #[test]
    fn normalization_defaults_every_missing_field() {
        let metadata = MatchMetadata::from_untrusted("u1", &Map::new());

        assert_eq!(metadata.user_id, "u1");
        assert!(!metadata.seeking_match);
        assert_eq!(metadata.opt_in_timestamp, None);
        assert_eq!(metadata.last_matched_cycle_id, None);
        assert_eq!(metadata.current_match_partner_id, None);
        assert_eq!(metadata.missed_cycles_count, 0);
        assert_eq!(metadata.last_opt_out_timestamp, None);
        assert_eq!(metadata.updated_at, 0);
    }

    #[test]
    fn normalization_defaults_every_mistyped_field() {
        let raw = payload(json!({
            "seekingMatch": "yes",
            "optInTimestamp": "tuesday",
            "lastMatchedCycleId": 42,
            "currentMatchPartnerId": true,
            "missedCyclesCount": -3,
            "lastOptOutTimestamp": {},
            "updatedAt": "recently",
        }));

        let metadata = MatchMetadata::from_untrusted("u1", &raw);

        assert!(!metadata.seeking_match);
        assert_eq!(metadata.opt_in_timestamp, None);
        assert_eq!(metadata.last_matched_cycle_id, None);
        assert_eq!(metadata.current_match_partner_id, None);
        assert_eq!(metadata.missed_cycles_count, 0);
        assert_eq!(metadata.last_opt_out_timestamp, None);
        assert_eq!(metadata.updated_at, 0);
    }

    #[test]
    fn normalization_keeps_well_typed_fields() {
        let raw = payload(json!({
            "userId": "someone-else",
            "seekingMatch": true,
            "optInTimestamp": 1700000000000i64,
            "lastMatchedCycleId": "cycle-9",
            "currentMatchPartnerId": "u7",
            "missedCyclesCount": 2,
            "updatedAt": 1700000001000i64,
        }));

        let metadata = MatchMetadata::from_untrusted("u1", &raw);

        // Key wins over any userId smuggled into the payload.
        assert_eq!(metadata.user_id, "u1");
        assert!(metadata.seeking_match);
        assert_eq!(metadata.opt_in_timestamp, Some(1700000000000));
        assert_eq!(metadata.last_matched_cycle_id, Some("cycle-9".to_string()));
        assert_eq!(metadata.current_match_partner_id, Some("u7".to_string()));
        assert_eq!(metadata.missed_cycles_count, 2);
        assert_eq!(metadata.updated_at, 1700000001000);
    }

    #[test]
    fn patch_preserves_unrelated_fields() {
        let mut metadata = MatchMetadata::new_seeker("u1");
        metadata.last_matched_cycle_id = Some("cycle-3".to_string());
        metadata.missed_cycles_count = 4;
        let previous_updated_at = metadata.updated_at;

        let patch = MatchMetadataPatch {
            seeking_match: Some(false),
            ..MatchMetadataPatch::default()
        };
        metadata.apply_patch(&patch, "u1");

        assert!(!metadata.seeking_match);
        assert_eq!(metadata.last_matched_cycle_id, Some("cycle-3".to_string()));
        assert_eq!(metadata.missed_cycles_count, 4);
        assert!(metadata.updated_at >= previous_updated_at);
    }

    #[test]
    fn patch_forces_canonical_user_id() {
        let mut metadata = MatchMetadata::new_seeker("u1");
        metadata.apply_patch(&MatchMetadataPatch::opt_out(), "u1");
        assert_eq!(metadata.user_id, "u1");
        assert!(!metadata.seeking_match);
        assert!(metadata.last_opt_out_timestamp.is_some());
    }

    #[test]
    fn empty_patch_detection() {
        assert!(MatchMetadataPatch::default().is_empty());
        assert!(!MatchMetadataPatch::opt_out().is_empty());

        // Unknown fields are ignored by serde, leaving an empty patch.
        let patch: MatchMetadataPatch =
            serde_json::from_value(json!({"unknownField": 1})).unwrap();
        assert!(patch.is_empty());
    }

    #[test]
    fn status_for_unknown_user_is_all_defaults() {
        let status = MatchingStatus::never_opted_in();
        assert!(!status.is_seeking_match);
        assert_eq!(status.missed_cycles_count, 0);
        assert!(status.has_never_opted_in);
        assert!(status.opt_in_timestamp.is_none());
        assert!(status.last_opt_out_timestamp.is_none());
    }

    #[test]
    fn status_distinguishes_opted_out_from_never_participated() {
        let mut metadata = MatchMetadata::new_seeker("u1");
        metadata.apply_patch(&MatchMetadataPatch::opt_out(), "u1");

        let status = MatchingStatus::from(&metadata);
        assert!(!status.is_seeking_match);
        assert!(!status.has_never_opted_in);
        assert!(status.opt_in_timestamp.is_some());
    }

    #[test]
    fn trait_staleness_uses_updated_at() {
        let fresh = UserTraits {
            user_id: "u1".to_string(),
            traits: vec!["curious".to_string()],
            source: "aggregator".to_string(),
            created_at: now_millis(),
            updated_at: now_millis(),
        };
        assert!(!fresh.is_stale(Duration::from_secs(60)));

        let stale = UserTraits {
            updated_at: now_millis() - 2 * 60 * 1000,
            ..fresh
        };
        assert!(stale.is_stale(Duration::from_secs(60)));
    }

    #[test]
    fn embedding_text_joins_traits_with_period_space() {
        let traits = UserTraits {
            user_id: "u1".to_string(),
            traits: vec![
                "enjoys strategy games".to_string(),
                "night owl".to_string(),
            ],
            source: "aggregator".to_string(),
            created_at: 0,
            updated_at: 0,
        };
        assert_eq!(
            traits.as_embedding_text(),
            "enjoys strategy games. night owl"
        );
    }

    #[test]
    fn metadata_round_trips_camel_case() {
        let metadata = MatchMetadata::new_seeker("u1");
        let value = serde_json::to_value(&metadata).unwrap();
        assert!(value.get("seekingMatch").is_some());
        assert!(value.get("optInTimestamp").is_some());
        // None optionals are omitted from the payload entirely.
        assert!(value.get("lastOptOutTimestamp").is_none());
    }
}
