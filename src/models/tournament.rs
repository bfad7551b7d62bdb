use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;
use validator::Validate;

/// Bracket host used for the public bracket link.
pub const BRACKET_BASE_URL: &str = "https://challonge.com";

/// Round number reserved for the third place match.
pub const BRONZE_ROUND: i32 = 0;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq, Eq)]
pub struct Tournament {
    pub id: Uuid,
    pub external_id: i64,
    pub name: String,
    pub slug: String,
    pub url: String,
    pub ongoing: bool,
    pub is_current: bool,
    pub current_round: i32,
    pub winner_id: Option<Uuid>,
}

/// Fields needed to insert a tournament row.
#[derive(Debug, Clone)]
pub struct NewTournament {
    pub external_id: i64,
    pub name: String,
    pub slug: String,
    pub url: String,
}

impl NewTournament {
    pub fn new(external_id: i64, name: &str) -> Self {
        let slug = slugify(name);
        Self {
            external_id,
            name: name.trim().to_string(),
            url: bracket_url(&slug),
            slug,
        }
    }
}

/// Turns a display name into the URL-safe slug used both locally and on the bracket host.
pub fn slugify(name: &str) -> String {
    name.trim().replace(' ', "_").to_lowercase()
}

pub fn bracket_url(slug: &str) -> String {
    format!("{}/{}", BRACKET_BASE_URL, slug)
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq, Eq)]
pub struct TournamentParticipant {
    pub id: Uuid,
    pub tournament_id: Uuid,
    pub member_id: Uuid,
    pub external_id: i64,
    pub reward_received: bool,
    pub reward_received_on: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq, Eq)]
pub struct TournamentMatch {
    pub id: Uuid,
    pub tournament_id: Uuid,
    pub participant1_id: Option<Uuid>,
    pub participant2_id: Option<Uuid>,
    pub external_id: i64,
    pub round: i32,
    pub completed: bool,
    pub winner_participant_id: Option<Uuid>,
    pub score: Option<String>,
    pub scheduled_datetime: Option<DateTime<Utc>>,
    pub evidence_url: Option<String>,
}

impl TournamentMatch {
    pub fn is_bronze(&self) -> bool {
        self.round == BRONZE_ROUND
    }

    /// Both slots are bound.
    pub fn is_resolved(&self) -> bool {
        self.participant1_id.is_some() && self.participant2_id.is_some()
    }

    pub fn involves(&self, participant_id: Uuid) -> bool {
        self.participant1_id == Some(participant_id) || self.participant2_id == Some(participant_id)
    }

    /// The other slot of the match, if `participant_id` occupies one.
    pub fn opponent_of(&self, participant_id: Uuid) -> Option<Uuid> {
        if self.participant1_id == Some(participant_id) {
            self.participant2_id
        } else if self.participant2_id == Some(participant_id) {
            self.participant1_id
        } else {
            None
        }
    }

    /// Loser of a completed match.
    pub fn loser(&self) -> Option<Uuid> {
        self.winner_participant_id
            .and_then(|winner| self.opponent_of(winner))
    }

    /// A completed match names exactly one of its two slots as winner.
    pub fn has_consistent_winner(&self) -> bool {
        if !self.completed {
            return true;
        }
        match self.winner_participant_id {
            Some(winner) => self.is_resolved() && self.involves(winner) && self.participant1_id != self.participant2_id,
            None => false,
        }
    }
}

/// A match row about to be inserted; mirrors what the bracket host knows about it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMatch {
    pub external_id: i64,
    pub round: i32,
    pub participant1_id: Option<Uuid>,
    pub participant2_id: Option<Uuid>,
    pub completed: bool,
    pub winner_participant_id: Option<Uuid>,
    pub score: Option<String>,
}

/// Slot and result fields that sync reconciliation overwrites.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchState {
    pub participant1_id: Option<Uuid>,
    pub participant2_id: Option<Uuid>,
    pub winner_participant_id: Option<Uuid>,
    pub score: Option<String>,
    pub completed: bool,
}

impl MatchState {
    pub fn of(m: &TournamentMatch) -> Self {
        Self {
            participant1_id: m.participant1_id,
            participant2_id: m.participant2_id,
            winner_participant_id: m.winner_participant_id,
            score: m.score.clone(),
            completed: m.completed,
        }
    }
}

// ===== API DTOs =====

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateTournamentRequest {
    #[validate(length(min = 3, max = 60))]
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SetCurrentTournamentRequest {
    #[validate(length(min = 1))]
    pub slug: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignUpRequest {
    pub member_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ReportResultRequest {
    /// Member who won the match.
    pub winner_member_id: Uuid,
    #[validate(url)]
    pub evidence_url: String,
    /// Score from the winner's side, e.g. `2-1`; defaults to a 1-0 win.
    #[validate(length(min = 3, max = 32))]
    pub score: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ScheduleMatchRequest {
    pub member_id: Uuid,
    pub opponent_member_id: Uuid,
    pub year: i32,
    #[validate(range(min = 1, max = 12))]
    pub month: u32,
    #[validate(range(min = 1, max = 31))]
    pub day: u32,
    #[validate(range(min = 0, max = 23))]
    pub hour: u32,
    #[validate(range(min = 0, max = 59))]
    pub minute: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed_match(p1: Option<Uuid>, p2: Option<Uuid>, winner: Option<Uuid>) -> TournamentMatch {
        TournamentMatch {
            id: Uuid::new_v4(),
            tournament_id: Uuid::new_v4(),
            participant1_id: p1,
            participant2_id: p2,
            external_id: 10,
            round: 1,
            completed: true,
            winner_participant_id: winner,
            score: Some("1-0".to_string()),
            scheduled_datetime: None,
            evidence_url: None,
        }
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Winter Cup 2025"), "winter_cup_2025");
        assert_eq!(slugify("  Solo  "), "solo");
    }

    #[test]
    fn test_new_tournament_url() {
        let t = NewTournament::new(77, "Spring Open");
        assert_eq!(t.slug, "spring_open");
        assert_eq!(t.url, "https://challonge.com/spring_open");
    }

    #[test]
    fn test_opponent_and_loser() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let m = completed_match(Some(a), Some(b), Some(b));
        assert_eq!(m.opponent_of(a), Some(b));
        assert_eq!(m.loser(), Some(a));
        assert_eq!(m.opponent_of(Uuid::new_v4()), None);
    }

    #[test]
    fn test_consistent_winner() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert!(completed_match(Some(a), Some(b), Some(a)).has_consistent_winner());
        assert!(!completed_match(Some(a), Some(b), Some(Uuid::new_v4())).has_consistent_winner());
        assert!(!completed_match(Some(a), None, Some(a)).has_consistent_winner());
        assert!(!completed_match(Some(a), Some(b), None).has_consistent_winner());
    }
}
