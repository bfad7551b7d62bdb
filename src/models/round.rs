use chrono::{DateTime, Datelike, Duration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::tournament::{bracket_url, BRONZE_ROUND};

/// Stage a round occupies in a single elimination bracket with one bronze match.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoundType {
    Normal,
    Semifinal,
    Final,
    Bronze,
}

impl RoundType {
    /// Classify `round` against the highest non-bronze round of the tournament.
    pub fn classify(round: i32, max_round: i32) -> RoundType {
        if round == BRONZE_ROUND {
            RoundType::Bronze
        } else if round >= max_round {
            RoundType::Final
        } else if max_round - round == 1 {
            RoundType::Semifinal
        } else {
            RoundType::Normal
        }
    }

    /// Final and bronze matches are the last games anybody plays.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RoundType::Final | RoundType::Bronze)
    }
}

impl std::fmt::Display for RoundType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoundType::Normal => write!(f, "normal"),
            RoundType::Semifinal => write!(f, "semifinal"),
            RoundType::Final => write!(f, "final"),
            RoundType::Bronze => write!(f, "bronze"),
        }
    }
}

/// Channel category holding the match channels of one round.
pub fn round_category(prefix: &str, round: i32) -> String {
    format!("{}-{}", prefix, round)
}

/// Final standings once both the final and the bronze match are decided.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Placements {
    pub first: Uuid,
    pub second: Uuid,
    pub third: Option<Uuid>,
    pub fourth: Option<Uuid>,
}

impl Placements {
    pub fn resolved(&self) -> Vec<Uuid> {
        let mut out = vec![self.first, self.second];
        out.extend(self.third);
        out.extend(self.fourth);
        out
    }
}

/// Round transition announcement handed to the chat layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoundAnnouncement {
    pub tournament_slug: String,
    pub bracket_url: String,
    /// `None` when the tournament has just started.
    pub finished_round: Option<i32>,
    pub new_round: i32,
    pub schedule_deadline: DateTime<Utc>,
    pub play_deadline: DateTime<Utc>,
}

impl RoundAnnouncement {
    /// Matches must be scheduled by the next Wednesday 12:00 UTC and played by
    /// the Sunday after it, 23:59 UTC.
    pub fn new(
        tournament_slug: &str,
        finished_round: Option<i32>,
        new_round: i32,
        now: DateTime<Utc>,
    ) -> Self {
        let wednesday = next_weekday(now, chrono::Weekday::Wed);
        let schedule_deadline = wednesday
            .date_naive()
            .and_time(NaiveTime::from_hms_opt(12, 0, 0).unwrap_or_default())
            .and_utc();
        let play_deadline = (wednesday + Duration::days(4))
            .date_naive()
            .and_time(NaiveTime::from_hms_opt(23, 59, 0).unwrap_or_default())
            .and_utc();

        Self {
            tournament_slug: tournament_slug.to_string(),
            bracket_url: bracket_url(tournament_slug),
            finished_round,
            new_round,
            schedule_deadline,
            play_deadline,
        }
    }
}

/// Next date strictly after `now` falling on `weekday`.
fn next_weekday(now: DateTime<Utc>, weekday: chrono::Weekday) -> DateTime<Utc> {
    let current = now.weekday().num_days_from_monday() as i64;
    let target = weekday.num_days_from_monday() as i64;
    let mut days_ahead = (target - current).rem_euclid(7);
    if days_ahead == 0 {
        days_ahead = 7;
    }
    now + Duration::days(days_ahead)
}
