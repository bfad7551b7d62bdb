//! Side-Effect Dispatcher
//!
//! Boundary towards the chat layer. The engine decides *when* a channel is
//! opened or closed and which announcement goes out; implementations decide
//! how. Dispatch failures are logged by the caller and never undo engine
//! state.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::models::{Member, Placements, RoundAnnouncement};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Dispatch webhook unreachable: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Dispatch webhook rejected event ({status}): {message}")]
    Rejected { status: u16, message: String },
}

/// Name of a chat channel created for a match or a reward.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelRef(pub String);

impl std::fmt::Display for ChannelRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn match_channel_name(a: &Member, b: &Member) -> ChannelRef {
    ChannelRef(format!("{}-vs-{}", a.username, b.username).to_lowercase())
}

pub fn reward_channel_name(member: &Member, tournament_slug: &str) -> ChannelRef {
    ChannelRef(format!("{}-reward-{}", member.username, tournament_slug).to_lowercase())
}

/// Events the chat layer receives, one per side effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DispatchEvent {
    OpenMatchChannel {
        category: String,
        round: i32,
        channel: ChannelRef,
        members: Vec<Member>,
    },
    OpenRewardChannel {
        tournament_slug: String,
        channel: ChannelRef,
        member: Member,
    },
    CloseChannels {
        category: String,
    },
    AnnounceRound {
        announcement: RoundAnnouncement,
    },
    TournamentCompleted {
        tournament_slug: String,
        placements: Placements,
    },
}

#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn open_match_channel(
        &self,
        participants: [&Member; 2],
        round: i32,
        category: &str,
    ) -> Result<ChannelRef, DispatchError>;

    /// One channel per member. Members that already had one are skipped.
    async fn open_reward_channel(
        &self,
        participants: &[Member],
        tournament_slug: &str,
    ) -> Result<Vec<ChannelRef>, DispatchError>;

    async fn close_channels(&self, round_category: &str) -> Result<(), DispatchError>;

    async fn announce_round(&self, announcement: &RoundAnnouncement) -> Result<(), DispatchError>;

    async fn announce_completion(
        &self,
        tournament_slug: &str,
        placements: &Placements,
    ) -> Result<(), DispatchError>;
}

/// Reward channels already requested in this process, keyed by member and tournament.
#[derive(Default)]
pub struct IssuedRewards {
    seen: Mutex<HashSet<(Uuid, String)>>,
}

impl IssuedRewards {
    /// `true` the first time a (member, tournament) pair is seen.
    pub fn first_request(&self, member_id: Uuid, tournament_slug: &str) -> bool {
        let mut seen = match self.seen.lock() {
            Ok(seen) => seen,
            Err(poisoned) => poisoned.into_inner(),
        };
        seen.insert((member_id, tournament_slug.to_string()))
    }

    /// Undo a reservation whose delivery failed.
    pub fn release(&self, member_id: Uuid, tournament_slug: &str) {
        let mut seen = match self.seen.lock() {
            Ok(seen) => seen,
            Err(poisoned) => poisoned.into_inner(),
        };
        seen.remove(&(member_id, tournament_slug.to_string()));
    }
}

// =============================================================================
// TRACING DISPATCHER
// =============================================================================

/// Logs every side effect. Used when no chat webhook is configured.
#[derive(Default)]
pub struct TracingDispatcher {
    issued: IssuedRewards,
}

impl TracingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Dispatcher for TracingDispatcher {
    async fn open_match_channel(
        &self,
        participants: [&Member; 2],
        round: i32,
        category: &str,
    ) -> Result<ChannelRef, DispatchError> {
        let channel = match_channel_name(participants[0], participants[1]);
        info!(channel = %channel, round = round, category = category, "Open match channel");
        Ok(channel)
    }

    async fn open_reward_channel(
        &self,
        participants: &[Member],
        tournament_slug: &str,
    ) -> Result<Vec<ChannelRef>, DispatchError> {
        let mut opened = Vec::new();
        for member in participants {
            let channel = reward_channel_name(member, tournament_slug);
            if !self.issued.first_request(member.id, tournament_slug) {
                debug!(channel = %channel, "Reward channel already exists, skipping");
                continue;
            }
            info!(channel = %channel, member = %member.username, "Open reward channel");
            opened.push(channel);
        }
        Ok(opened)
    }

    async fn close_channels(&self, round_category: &str) -> Result<(), DispatchError> {
        info!(category = round_category, "Close channels");
        Ok(())
    }

    async fn announce_round(&self, announcement: &RoundAnnouncement) -> Result<(), DispatchError> {
        info!(
            tournament = %announcement.tournament_slug,
            finished_round = ?announcement.finished_round,
            new_round = announcement.new_round,
            schedule_deadline = %announcement.schedule_deadline,
            play_deadline = %announcement.play_deadline,
            "Announce round"
        );
        Ok(())
    }

    async fn announce_completion(
        &self,
        tournament_slug: &str,
        placements: &Placements,
    ) -> Result<(), DispatchError> {
        info!(
            tournament = tournament_slug,
            first = %placements.first,
            second = %placements.second,
            third = ?placements.third,
            fourth = ?placements.fourth,
            "Tournament completed"
        );
        Ok(())
    }
}

// =============================================================================
// WEBHOOK DISPATCHER
// =============================================================================

/// Posts each side effect as a tagged JSON [`DispatchEvent`] to the chat layer.
pub struct WebhookDispatcher {
    client: reqwest::Client,
    url: String,
    issued: IssuedRewards,
}

impl WebhookDispatcher {
    pub fn new(url: String, timeout: Duration) -> Result<Self, DispatchError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url,
            issued: IssuedRewards::default(),
        })
    }

    async fn post(&self, event: &DispatchEvent) -> Result<(), DispatchError> {
        debug!(url = %self.url, event = ?event, "Posting dispatch event");
        let response = self.client.post(&self.url).json(event).send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(DispatchError::Rejected {
                status: status.as_u16(),
                message,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Dispatcher for WebhookDispatcher {
    async fn open_match_channel(
        &self,
        participants: [&Member; 2],
        round: i32,
        category: &str,
    ) -> Result<ChannelRef, DispatchError> {
        let channel = match_channel_name(participants[0], participants[1]);
        self.post(&DispatchEvent::OpenMatchChannel {
            category: category.to_string(),
            round,
            channel: channel.clone(),
            members: vec![participants[0].clone(), participants[1].clone()],
        })
        .await?;
        Ok(channel)
    }

    async fn open_reward_channel(
        &self,
        participants: &[Member],
        tournament_slug: &str,
    ) -> Result<Vec<ChannelRef>, DispatchError> {
        let mut opened = Vec::new();
        for member in participants {
            if !self.issued.first_request(member.id, tournament_slug) {
                continue;
            }
            let channel = reward_channel_name(member, tournament_slug);
            let event = DispatchEvent::OpenRewardChannel {
                tournament_slug: tournament_slug.to_string(),
                channel: channel.clone(),
                member: member.clone(),
            };
            if let Err(e) = self.post(&event).await {
                self.issued.release(member.id, tournament_slug);
                return Err(e);
            }
            opened.push(channel);
        }
        Ok(opened)
    }

    async fn close_channels(&self, round_category: &str) -> Result<(), DispatchError> {
        self.post(&DispatchEvent::CloseChannels {
            category: round_category.to_string(),
        })
        .await
    }

    async fn announce_round(&self, announcement: &RoundAnnouncement) -> Result<(), DispatchError> {
        self.post(&DispatchEvent::AnnounceRound {
            announcement: announcement.clone(),
        })
        .await
    }

    async fn announce_completion(
        &self,
        tournament_slug: &str,
        placements: &Placements,
    ) -> Result<(), DispatchError> {
        self.post(&DispatchEvent::TournamentCompleted {
            tournament_slug: tournament_slug.to_string(),
            placements: placements.clone(),
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(name: &str) -> Member {
        Member {
            id: Uuid::new_v4(),
            discord_id: 1,
            username: name.to_string(),
            timezone: None,
            country_code: None,
        }
    }

    #[test]
    fn test_channel_names() {
        let a = member("Ash");
        let b = member("Misty");
        assert_eq!(match_channel_name(&a, &b).0, "ash-vs-misty");
        assert_eq!(reward_channel_name(&a, "fall_cup").0, "ash-reward-fall_cup");
    }

    #[test]
    fn test_event_is_tagged() {
        let event = DispatchEvent::CloseChannels {
            category: "round-2".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "close_channels");
        assert_eq!(json["category"], "round-2");
    }

    #[tokio::test]
    async fn test_reward_channel_is_idempotent() {
        let dispatcher = TracingDispatcher::new();
        let a = member("ash");
        let b = member("misty");

        let first = dispatcher
            .open_reward_channel(&[a.clone(), b.clone()], "cup")
            .await
            .unwrap();
        assert_eq!(first.len(), 2);

        let second = dispatcher.open_reward_channel(&[a.clone()], "cup").await.unwrap();
        assert!(second.is_empty());

        // same member, other tournament
        let other = dispatcher.open_reward_channel(&[a], "spring").await.unwrap();
        assert_eq!(other.len(), 1);
    }
}
