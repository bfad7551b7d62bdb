//! Bracket Provider Client
//!
//! Thin asynchronous client over the Challonge v1 REST API, which hosts the
//! authoritative single elimination bracket. The client keeps no state and
//! never retries: every failure comes back as a [`BracketProviderError`] and
//! the caller decides between aborting and logging.
//!
//! All identifiers exchanged here are Challonge-native integers. They are
//! mapped to local rows through the `external_id` columns and never compared
//! with local primary keys.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

pub const DEFAULT_BASE_URL: &str = "https://api.challonge.com/v1";

#[derive(Debug, Error)]
pub enum BracketProviderError {
    #[error("Bracket provider unreachable: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Bracket provider rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Invalid bracket provider response: {0}")]
    InvalidResponse(String),
}

/// Match state as reported by the bracket host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExternalMatchState {
    Pending,
    Open,
    Complete,
}

/// A bracket match in the provider's own identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalMatch {
    pub id: i64,
    /// Positive for bracket rounds, 0 for the third place match.
    pub round: i32,
    pub player1_id: Option<i64>,
    pub player2_id: Option<i64>,
    pub winner_id: Option<i64>,
    pub loser_id: Option<i64>,
    pub state: ExternalMatchState,
    #[serde(default)]
    pub scores_csv: Option<String>,
}

impl ExternalMatch {
    pub fn is_complete(&self) -> bool {
        self.state == ExternalMatchState::Complete
    }

    pub fn involves(&self, participant_id: i64) -> bool {
        self.player1_id == Some(participant_id) || self.player2_id == Some(participant_id)
    }

    /// Empty score strings are reported as no score.
    pub fn score(&self) -> Option<String> {
        self.scores_csv
            .as_ref()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalParticipant {
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub final_rank: Option<i32>,
}

/// Operations the engine needs from the bracket host.
#[async_trait]
pub trait BracketProvider: Send + Sync {
    /// Creates a single elimination bracket holding a third place match.
    async fn create_tournament(&self, name: &str, slug: &str) -> Result<i64, BracketProviderError>;

    async fn destroy_tournament(&self, slug: &str) -> Result<(), BracketProviderError>;

    async fn create_participant(
        &self,
        slug: &str,
        name: &str,
        misc: &str,
    ) -> Result<i64, BracketProviderError>;

    async fn destroy_participant(
        &self,
        slug: &str,
        external_participant_id: i64,
    ) -> Result<(), BracketProviderError>;

    /// Randomizes seeds, then starts the bracket.
    async fn start_tournament(&self, slug: &str) -> Result<(), BracketProviderError>;

    async fn list_matches(
        &self,
        slug: &str,
        participant_filter: Option<i64>,
    ) -> Result<Vec<ExternalMatch>, BracketProviderError>;

    /// `score` is a scores_csv value such as `1-0`, oriented player1-player2.
    async fn update_match(
        &self,
        slug: &str,
        external_match_id: i64,
        score: &str,
        winner_external_id: i64,
    ) -> Result<(), BracketProviderError>;

    async fn finalize(&self, slug: &str) -> Result<(), BracketProviderError>;

    async fn list_participants(&self, slug: &str) -> Result<Vec<ExternalParticipant>, BracketProviderError>;

    async fn ranked_participant(
        &self,
        slug: &str,
        rank: i32,
    ) -> Result<Option<i64>, BracketProviderError> {
        let participants = self.list_participants(slug).await?;
        Ok(participants
            .into_iter()
            .find(|p| p.final_rank == Some(rank))
            .map(|p| p.id))
    }

    /// First not-yet-complete match the participant appears in.
    async fn find_next_match_for_participant(
        &self,
        slug: &str,
        external_participant_id: i64,
    ) -> Result<Option<ExternalMatch>, BracketProviderError> {
        let matches = self
            .list_matches(slug, Some(external_participant_id))
            .await?;
        Ok(matches
            .into_iter()
            .find(|m| !m.is_complete() && m.involves(external_participant_id)))
    }
}

/// Challonge credentials and endpoint.
#[derive(Debug, Clone)]
pub struct ChallongeConfig {
    pub base_url: String,
    pub username: String,
    pub api_key: String,
    pub timeout: Duration,
}

impl ChallongeConfig {
    pub fn new(username: String, api_key: String) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            username,
            api_key,
            timeout: Duration::from_secs(10),
        }
    }
}

// ----- wire envelopes -----

#[derive(Debug, Deserialize)]
struct TournamentEnvelope {
    tournament: TournamentBody,
}

#[derive(Debug, Deserialize)]
struct TournamentBody {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct MatchEnvelope {
    #[serde(rename = "match")]
    inner: ExternalMatch,
}

#[derive(Debug, Deserialize)]
struct ParticipantEnvelope {
    participant: ExternalParticipant,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    errors: Vec<String>,
}

/// Challonge-backed [`BracketProvider`].
#[derive(Clone)]
pub struct ChallongeService {
    config: ChallongeConfig,
    client: reqwest::Client,
}

impl ChallongeService {
    pub fn new(config: ChallongeConfig) -> Result<Self, BracketProviderError> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { config, client })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// Sends the request and decodes a JSON body, turning non-2xx answers into
    /// [`BracketProviderError::Rejected`] carrying the provider's messages.
    async fn call<T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<serde_json::Value>,
    ) -> Result<T, BracketProviderError> {
        let text = self.send(method, path, query, body).await?;
        serde_json::from_str(&text).map_err(|e| {
            BracketProviderError::InvalidResponse(format!("{} on {}: {}", e, path, text))
        })
    }

    async fn send(
        &self,
        method: reqwest::Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<serde_json::Value>,
    ) -> Result<String, BracketProviderError> {
        debug!(method = %method, path = path, "Calling bracket provider");

        let mut request = self
            .client
            .request(method, self.url(path))
            .basic_auth(&self.config.username, Some(&self.config.api_key))
            .query(query);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(rejection(status, &text));
        }
        Ok(text)
    }
}

fn rejection(status: StatusCode, text: &str) -> BracketProviderError {
    let message = serde_json::from_str::<ErrorBody>(text)
        .ok()
        .filter(|b| !b.errors.is_empty())
        .map(|b| b.errors.join("; "))
        .unwrap_or_else(|| text.trim().to_string());
    BracketProviderError::Rejected {
        status: status.as_u16(),
        message,
    }
}

#[async_trait]
impl BracketProvider for ChallongeService {
    async fn create_tournament(&self, name: &str, slug: &str) -> Result<i64, BracketProviderError> {
        let body = serde_json::json!({
            "tournament": {
                "name": name,
                "url": slug,
                "tournament_type": "single elimination",
                "hold_third_place_match": true,
            }
        });
        let created: TournamentEnvelope = self
            .call(reqwest::Method::POST, "tournaments.json", &[], Some(body))
            .await?;
        info!(slug = slug, external_id = created.tournament.id, "Bracket created");
        Ok(created.tournament.id)
    }

    async fn destroy_tournament(&self, slug: &str) -> Result<(), BracketProviderError> {
        self.send(reqwest::Method::DELETE, &format!("tournaments/{}.json", slug), &[], None)
            .await?;
        Ok(())
    }

    async fn create_participant(
        &self,
        slug: &str,
        name: &str,
        misc: &str,
    ) -> Result<i64, BracketProviderError> {
        let body = serde_json::json!({
            "participant": { "name": name, "misc": misc }
        });
        let created: ParticipantEnvelope = self
            .call(
                reqwest::Method::POST,
                &format!("tournaments/{}/participants.json", slug),
                &[],
                Some(body),
            )
            .await?;
        Ok(created.participant.id)
    }

    async fn destroy_participant(
        &self,
        slug: &str,
        external_participant_id: i64,
    ) -> Result<(), BracketProviderError> {
        self.send(
            reqwest::Method::DELETE,
            &format!("tournaments/{}/participants/{}.json", slug, external_participant_id),
            &[],
            None,
        )
        .await?;
        Ok(())
    }

    async fn start_tournament(&self, slug: &str) -> Result<(), BracketProviderError> {
        self.send(
            reqwest::Method::POST,
            &format!("tournaments/{}/participants/randomize.json", slug),
            &[],
            None,
        )
        .await?;
        self.send(
            reqwest::Method::POST,
            &format!("tournaments/{}/start.json", slug),
            &[],
            None,
        )
        .await?;
        info!(slug = slug, "Bracket seeded and started");
        Ok(())
    }

    async fn list_matches(
        &self,
        slug: &str,
        participant_filter: Option<i64>,
    ) -> Result<Vec<ExternalMatch>, BracketProviderError> {
        let query: Vec<(&str, String)> = participant_filter
            .map(|id| vec![("participant_id", id.to_string())])
            .unwrap_or_default();
        let matches: Vec<MatchEnvelope> = self
            .call(
                reqwest::Method::GET,
                &format!("tournaments/{}/matches.json", slug),
                &query,
                None,
            )
            .await?;
        Ok(matches.into_iter().map(|m| m.inner).collect())
    }

    async fn update_match(
        &self,
        slug: &str,
        external_match_id: i64,
        score: &str,
        winner_external_id: i64,
    ) -> Result<(), BracketProviderError> {
        let body = serde_json::json!({
            "match": { "scores_csv": score, "winner_id": winner_external_id }
        });
        self.send(
            reqwest::Method::PUT,
            &format!("tournaments/{}/matches/{}.json", slug, external_match_id),
            &[],
            Some(body),
        )
        .await?;
        info!(
            slug = slug,
            external_match_id = external_match_id,
            winner = winner_external_id,
            "Match result pushed to bracket"
        );
        Ok(())
    }

    async fn finalize(&self, slug: &str) -> Result<(), BracketProviderError> {
        self.send(
            reqwest::Method::POST,
            &format!("tournaments/{}/finalize.json", slug),
            &[],
            None,
        )
        .await?;
        Ok(())
    }

    async fn list_participants(&self, slug: &str) -> Result<Vec<ExternalParticipant>, BracketProviderError> {
        let participants: Vec<ParticipantEnvelope> = self
            .call(
                reqwest::Method::GET,
                &format!("tournaments/{}/participants.json", slug),
                &[],
                None,
            )
            .await?;
        Ok(participants.into_iter().map(|p| p.participant).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MATCHES_PAYLOAD: &str = r#"[
        {"match": {"id": 5001, "round": 1, "player1_id": 11, "player2_id": 12,
                   "winner_id": 11, "loser_id": 12, "state": "complete", "scores_csv": "2-1",
                   "identifier": "A", "underway_at": null}},
        {"match": {"id": 5003, "round": 2, "player1_id": 11, "player2_id": null,
                   "winner_id": null, "loser_id": null, "state": "pending", "scores_csv": ""}},
        {"match": {"id": 5004, "round": 0, "player1_id": null, "player2_id": null,
                   "winner_id": null, "loser_id": null, "state": "pending"}}
    ]"#;

    #[test]
    fn test_decode_match_list() {
        let decoded: Vec<MatchEnvelope> = serde_json::from_str(MATCHES_PAYLOAD).unwrap();
        let matches: Vec<ExternalMatch> = decoded.into_iter().map(|m| m.inner).collect();

        assert_eq!(matches.len(), 3);
        assert!(matches[0].is_complete());
        assert_eq!(matches[0].score().as_deref(), Some("2-1"));
        assert_eq!(matches[1].state, ExternalMatchState::Pending);
        assert_eq!(matches[1].score(), None);
        assert_eq!(matches[2].round, 0);
        assert_eq!(matches[2].scores_csv, None);
    }

    #[test]
    fn test_decode_participants_with_rank() {
        let payload = r#"[
            {"participant": {"id": 11, "name": "ash", "final_rank": 1}},
            {"participant": {"id": 12, "name": "misty", "final_rank": null}}
        ]"#;
        let decoded: Vec<ParticipantEnvelope> = serde_json::from_str(payload).unwrap();
        assert_eq!(decoded[0].participant.final_rank, Some(1));
        assert_eq!(decoded[1].participant.final_rank, None);
    }

    #[test]
    fn test_rejection_carries_provider_messages() {
        let err = rejection(
            StatusCode::UNPROCESSABLE_ENTITY,
            r#"{"errors": ["URL is already taken", "Name is too long"]}"#,
        );
        match err {
            BracketProviderError::Rejected { status, message } => {
                assert_eq!(status, 422);
                assert_eq!(message, "URL is already taken; Name is too long");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_rejection_falls_back_to_body() {
        let err = rejection(StatusCode::UNAUTHORIZED, "HTTP Basic: Access denied.\n");
        assert_eq!(
            err.to_string(),
            "Bracket provider rejected the request (401): HTTP Basic: Access denied."
        );
    }

    #[test]
    fn test_url_join() {
        let mut config = ChallongeConfig::new("user".to_string(), "key".to_string());
        config.base_url = "http://localhost:9000/v1/".to_string();
        let service = ChallongeService::new(config).unwrap();
        assert_eq!(
            service.url("tournaments/cup/matches.json"),
            "http://localhost:9000/v1/tournaments/cup/matches.json"
        );
    }

    #[test]
    fn test_involves_and_next_match_filter() {
        let m = ExternalMatch {
            id: 1,
            round: 2,
            player1_id: Some(7),
            player2_id: None,
            winner_id: None,
            loser_id: None,
            state: ExternalMatchState::Pending,
            scores_csv: None,
        };
        assert!(m.involves(7));
        assert!(!m.involves(8));
        assert!(!m.is_complete());
    }
}
