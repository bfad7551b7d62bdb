use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{RepositoryError, TournamentRepository};
use crate::models::{
    Member, MatchState, NewMatch, NewTournament, Tournament, TournamentMatch, TournamentParticipant,
};

#[derive(Default)]
struct MemoryState {
    members: HashMap<Uuid, Member>,
    tournaments: HashMap<Uuid, Tournament>,
    participants: HashMap<Uuid, TournamentParticipant>,
    matches: HashMap<Uuid, TournamentMatch>,
}

impl MemoryState {
    fn same_pair(m: &TournamentMatch, a: Uuid, b: Uuid) -> bool {
        (m.participant1_id == Some(a) && m.participant2_id == Some(b))
            || (m.participant1_id == Some(b) && m.participant2_id == Some(a))
    }

    /// Open match uniqueness per participant pair, ignoring `except`.
    fn check_open_pair(
        &self,
        tournament_id: Uuid,
        p1: Option<Uuid>,
        p2: Option<Uuid>,
        completed: bool,
        except: Option<Uuid>,
    ) -> Result<(), RepositoryError> {
        let (Some(a), Some(b)) = (p1, p2) else {
            return Ok(());
        };
        if completed {
            return Ok(());
        }
        let clash = self.matches.values().any(|m| {
            Some(m.id) != except
                && m.tournament_id == tournament_id
                && !m.completed
                && Self::same_pair(m, a, b)
        });
        if clash {
            return Err(RepositoryError::UniqueViolation(
                "open match for participant pair".to_string(),
            ));
        }
        Ok(())
    }

    fn match_mut(&mut self, match_id: Uuid) -> Result<&mut TournamentMatch, RepositoryError> {
        self.matches
            .get_mut(&match_id)
            .ok_or_else(|| RepositoryError::NotFound("tournament match".to_string()))
    }

    fn tournament_mut(&mut self, tournament_id: Uuid) -> Result<&mut Tournament, RepositoryError> {
        self.tournaments
            .get_mut(&tournament_id)
            .ok_or_else(|| RepositoryError::NotFound("tournament".to_string()))
    }
}

/// Repository kept in process memory behind a single lock, so every write,
/// including the multi-row ones, is atomic.
#[derive(Default)]
pub struct InMemoryTournamentRepository {
    state: RwLock<MemoryState>,
}

impl InMemoryTournamentRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Members are owned by another subsystem; this seeds them.
    pub fn insert_member(&self, member: Member) -> Result<(), RepositoryError> {
        let mut state = self.write()?;
        if state.members.values().any(|m| m.discord_id == member.discord_id && m.id != member.id) {
            return Err(RepositoryError::UniqueViolation("member discord id".to_string()));
        }
        state.members.insert(member.id, member);
        Ok(())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryState>, RepositoryError> {
        self.state.read().map_err(|_| RepositoryError::LockPoisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryState>, RepositoryError> {
        self.state.write().map_err(|_| RepositoryError::LockPoisoned)
    }
}

fn sorted(mut matches: Vec<TournamentMatch>) -> Vec<TournamentMatch> {
    matches.sort_by_key(|m| (m.round, m.external_id));
    matches
}

#[async_trait]
impl TournamentRepository for InMemoryTournamentRepository {
    async fn create_tournament(&self, new: NewTournament) -> Result<Tournament, RepositoryError> {
        let mut state = self.write()?;
        if state.tournaments.values().any(|t| t.slug == new.slug) {
            return Err(RepositoryError::UniqueViolation("tournament slug".to_string()));
        }
        let tournament = Tournament {
            id: Uuid::new_v4(),
            external_id: new.external_id,
            name: new.name,
            slug: new.slug,
            url: new.url,
            ongoing: false,
            is_current: false,
            current_round: 1,
            winner_id: None,
        };
        state.tournaments.insert(tournament.id, tournament.clone());
        Ok(tournament)
    }

    async fn delete_tournament(&self, tournament_id: Uuid) -> Result<(), RepositoryError> {
        let mut state = self.write()?;
        if state.tournaments.remove(&tournament_id).is_none() {
            return Err(RepositoryError::NotFound("tournament".to_string()));
        }
        state.participants.retain(|_, p| p.tournament_id != tournament_id);
        state.matches.retain(|_, m| m.tournament_id != tournament_id);
        Ok(())
    }

    async fn load_by_slug(&self, slug: &str) -> Result<Option<Tournament>, RepositoryError> {
        let state = self.read()?;
        Ok(state.tournaments.values().find(|t| t.slug == slug).cloned())
    }

    async fn load_tournament(&self, tournament_id: Uuid) -> Result<Option<Tournament>, RepositoryError> {
        Ok(self.read()?.tournaments.get(&tournament_id).cloned())
    }

    async fn load_current(&self) -> Result<Option<Tournament>, RepositoryError> {
        let state = self.read()?;
        Ok(state.tournaments.values().find(|t| t.is_current).cloned())
    }

    async fn set_current(&self, tournament_id: Uuid) -> Result<(), RepositoryError> {
        let mut state = self.write()?;
        if !state.tournaments.contains_key(&tournament_id) {
            return Err(RepositoryError::NotFound("tournament".to_string()));
        }
        for t in state.tournaments.values_mut() {
            t.is_current = t.id == tournament_id;
        }
        Ok(())
    }

    async fn set_ongoing(&self, tournament_id: Uuid, ongoing: bool) -> Result<(), RepositoryError> {
        self.write()?.tournament_mut(tournament_id)?.ongoing = ongoing;
        Ok(())
    }

    async fn set_winner(
        &self,
        tournament_id: Uuid,
        winner_participant_id: Option<Uuid>,
    ) -> Result<(), RepositoryError> {
        self.write()?.tournament_mut(tournament_id)?.winner_id = winner_participant_id;
        Ok(())
    }

    async fn advance_round(
        &self,
        tournament_id: Uuid,
        expected: i32,
        next: i32,
    ) -> Result<bool, RepositoryError> {
        let mut state = self.write()?;
        let tournament = state.tournament_mut(tournament_id)?;
        if tournament.current_round != expected {
            return Ok(false);
        }
        tournament.current_round = next;
        Ok(true)
    }

    async fn load_member(&self, member_id: Uuid) -> Result<Option<Member>, RepositoryError> {
        Ok(self.read()?.members.get(&member_id).cloned())
    }

    async fn insert_participant(
        &self,
        tournament_id: Uuid,
        member_id: Uuid,
        external_id: i64,
    ) -> Result<TournamentParticipant, RepositoryError> {
        let mut state = self.write()?;
        let clash = state.participants.values().any(|p| {
            p.tournament_id == tournament_id
                && (p.member_id == member_id || p.external_id == external_id)
        });
        if clash {
            return Err(RepositoryError::UniqueViolation("tournament participant".to_string()));
        }
        let participant = TournamentParticipant {
            id: Uuid::new_v4(),
            tournament_id,
            member_id,
            external_id,
            reward_received: false,
            reward_received_on: None,
        };
        state.participants.insert(participant.id, participant.clone());
        Ok(participant)
    }

    async fn delete_participant(&self, participant_id: Uuid) -> Result<(), RepositoryError> {
        let mut state = self.write()?;
        if state.participants.remove(&participant_id).is_none() {
            return Err(RepositoryError::NotFound("tournament participant".to_string()));
        }
        let gone = Some(participant_id);
        for m in state.matches.values_mut() {
            if m.participant1_id == gone {
                m.participant1_id = None;
            }
            if m.participant2_id == gone {
                m.participant2_id = None;
            }
            if m.winner_participant_id == gone {
                m.winner_participant_id = None;
            }
        }
        for t in state.tournaments.values_mut() {
            if t.winner_id == gone {
                t.winner_id = None;
            }
        }
        Ok(())
    }

    async fn load_participant(
        &self,
        participant_id: Uuid,
    ) -> Result<Option<TournamentParticipant>, RepositoryError> {
        Ok(self.read()?.participants.get(&participant_id).cloned())
    }

    async fn load_participant_by_member(
        &self,
        tournament_id: Uuid,
        member_id: Uuid,
    ) -> Result<Option<TournamentParticipant>, RepositoryError> {
        let state = self.read()?;
        Ok(state
            .participants
            .values()
            .find(|p| p.tournament_id == tournament_id && p.member_id == member_id)
            .cloned())
    }

    async fn load_participant_by_external_id(
        &self,
        tournament_id: Uuid,
        external_id: i64,
    ) -> Result<Option<TournamentParticipant>, RepositoryError> {
        let state = self.read()?;
        Ok(state
            .participants
            .values()
            .find(|p| p.tournament_id == tournament_id && p.external_id == external_id)
            .cloned())
    }

    async fn list_participants(
        &self,
        tournament_id: Uuid,
    ) -> Result<Vec<TournamentParticipant>, RepositoryError> {
        let state = self.read()?;
        let mut participants: Vec<_> = state
            .participants
            .values()
            .filter(|p| p.tournament_id == tournament_id)
            .cloned()
            .collect();
        participants.sort_by_key(|p| p.external_id);
        Ok(participants)
    }

    async fn mark_reward_received(
        &self,
        participant_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let mut state = self.write()?;
        let participant = state
            .participants
            .get_mut(&participant_id)
            .ok_or_else(|| RepositoryError::NotFound("tournament participant".to_string()))?;
        participant.reward_received = true;
        participant.reward_received_on = Some(at);
        Ok(())
    }

    async fn bulk_insert_matches(
        &self,
        tournament_id: Uuid,
        matches: &[NewMatch],
    ) -> Result<Vec<TournamentMatch>, RepositoryError> {
        let mut state = self.write()?;

        // Validate the whole batch first so a failure leaves nothing behind.
        let mut batch: Vec<TournamentMatch> = Vec::with_capacity(matches.len());
        for m in matches {
            let exists = state
                .matches
                .values()
                .chain(batch.iter())
                .any(|existing| existing.tournament_id == tournament_id && existing.external_id == m.external_id);
            if exists {
                continue;
            }
            state.check_open_pair(tournament_id, m.participant1_id, m.participant2_id, m.completed, None)?;
            if let (Some(a), Some(b)) = (m.participant1_id, m.participant2_id) {
                if !m.completed && batch.iter().any(|x| !x.completed && MemoryState::same_pair(x, a, b)) {
                    return Err(RepositoryError::UniqueViolation(
                        "open match for participant pair".to_string(),
                    ));
                }
            }
            batch.push(TournamentMatch {
                id: Uuid::new_v4(),
                tournament_id,
                participant1_id: m.participant1_id,
                participant2_id: m.participant2_id,
                external_id: m.external_id,
                round: m.round,
                completed: m.completed,
                winner_participant_id: m.winner_participant_id,
                score: m.score.clone(),
                scheduled_datetime: None,
                evidence_url: None,
            });
        }

        for m in &batch {
            state.matches.insert(m.id, m.clone());
        }
        Ok(batch)
    }

    async fn load_match(&self, match_id: Uuid) -> Result<Option<TournamentMatch>, RepositoryError> {
        Ok(self.read()?.matches.get(&match_id).cloned())
    }

    async fn load_match_by_external_id(
        &self,
        tournament_id: Uuid,
        external_id: i64,
    ) -> Result<Option<TournamentMatch>, RepositoryError> {
        let state = self.read()?;
        Ok(state
            .matches
            .values()
            .find(|m| m.tournament_id == tournament_id && m.external_id == external_id)
            .cloned())
    }

    async fn load_open_match_for_pair(
        &self,
        tournament_id: Uuid,
        a: Uuid,
        b: Uuid,
    ) -> Result<Option<TournamentMatch>, RepositoryError> {
        let state = self.read()?;
        Ok(state
            .matches
            .values()
            .find(|m| m.tournament_id == tournament_id && !m.completed && MemoryState::same_pair(m, a, b))
            .cloned())
    }

    async fn load_open_match_for_participant(
        &self,
        tournament_id: Uuid,
        participant_id: Uuid,
    ) -> Result<Option<TournamentMatch>, RepositoryError> {
        let state = self.read()?;
        Ok(state
            .matches
            .values()
            .filter(|m| {
                m.tournament_id == tournament_id
                    && !m.completed
                    && m.is_resolved()
                    && m.involves(participant_id)
            })
            .max_by_key(|m| m.round)
            .cloned())
    }

    async fn load_round_matches(
        &self,
        tournament_id: Uuid,
        round: i32,
    ) -> Result<Vec<TournamentMatch>, RepositoryError> {
        let state = self.read()?;
        Ok(sorted(
            state
                .matches
                .values()
                .filter(|m| m.tournament_id == tournament_id && m.round == round)
                .cloned()
                .collect(),
        ))
    }

    async fn list_matches(&self, tournament_id: Uuid) -> Result<Vec<TournamentMatch>, RepositoryError> {
        let state = self.read()?;
        Ok(sorted(
            state
                .matches
                .values()
                .filter(|m| m.tournament_id == tournament_id)
                .cloned()
                .collect(),
        ))
    }

    async fn count_open_matches_in_round(
        &self,
        tournament_id: Uuid,
        round: i32,
    ) -> Result<i64, RepositoryError> {
        let state = self.read()?;
        Ok(state
            .matches
            .values()
            .filter(|m| m.tournament_id == tournament_id && m.round == round && !m.completed)
            .count() as i64)
    }

    async fn max_round(&self, tournament_id: Uuid) -> Result<Option<i32>, RepositoryError> {
        let state = self.read()?;
        Ok(state
            .matches
            .values()
            .filter(|m| m.tournament_id == tournament_id && m.round > 0)
            .map(|m| m.round)
            .max())
    }

    async fn bind_participants(
        &self,
        match_id: Uuid,
        participant1_id: Option<Uuid>,
        participant2_id: Option<Uuid>,
    ) -> Result<(), RepositoryError> {
        let mut state = self.write()?;
        let (tournament_id, completed) = {
            let m = state.match_mut(match_id)?;
            (m.tournament_id, m.completed)
        };
        state.check_open_pair(tournament_id, participant1_id, participant2_id, completed, Some(match_id))?;
        let m = state.match_mut(match_id)?;
        m.participant1_id = participant1_id;
        m.participant2_id = participant2_id;
        Ok(())
    }

    async fn record_result(
        &self,
        match_id: Uuid,
        winner_participant_id: Uuid,
        score: &str,
        evidence_url: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let mut state = self.write()?;
        let m = state.match_mut(match_id)?;
        m.completed = true;
        m.winner_participant_id = Some(winner_participant_id);
        m.score = Some(score.to_string());
        if let Some(url) = evidence_url {
            m.evidence_url = Some(url.to_string());
        }
        Ok(())
    }

    async fn overwrite_match_state(
        &self,
        match_id: Uuid,
        new_state: &MatchState,
    ) -> Result<(), RepositoryError> {
        let mut state = self.write()?;
        let tournament_id = state.match_mut(match_id)?.tournament_id;
        state.check_open_pair(
            tournament_id,
            new_state.participant1_id,
            new_state.participant2_id,
            new_state.completed,
            Some(match_id),
        )?;
        let m = state.match_mut(match_id)?;
        m.participant1_id = new_state.participant1_id;
        m.participant2_id = new_state.participant2_id;
        m.winner_participant_id = new_state.winner_participant_id;
        m.score = new_state.score.clone();
        m.completed = new_state.completed;
        Ok(())
    }

    async fn schedule_match(
        &self,
        match_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        self.write()?.match_mut(match_id)?.scheduled_datetime = Some(at);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn new_match(external_id: i64, round: i32, p1: Option<Uuid>, p2: Option<Uuid>) -> NewMatch {
        NewMatch {
            external_id,
            round,
            participant1_id: p1,
            participant2_id: p2,
            completed: false,
            winner_participant_id: None,
            score: None,
        }
    }

    #[tokio::test]
    async fn test_set_current_keeps_single_row() {
        let repo = InMemoryTournamentRepository::new();
        let a = repo.create_tournament(NewTournament::new(1, "Cup A")).await.unwrap();
        let b = repo.create_tournament(NewTournament::new(2, "Cup B")).await.unwrap();
        let c = repo.create_tournament(NewTournament::new(3, "Cup C")).await.unwrap();

        for id in [a.id, b.id, c.id, a.id, c.id] {
            repo.set_current(id).await.unwrap();
            let state = repo.read().unwrap();
            let current: Vec<_> = state.tournaments.values().filter(|t| t.is_current).collect();
            assert_eq!(current.len(), 1);
            assert_eq!(current[0].id, id);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_set_current() {
        let repo = Arc::new(InMemoryTournamentRepository::new());
        let mut ids = Vec::new();
        for i in 0..8 {
            let t = repo
                .create_tournament(NewTournament::new(i, &format!("Cup {}", i)))
                .await
                .unwrap();
            ids.push(t.id);
        }

        let handles: Vec<_> = ids
            .iter()
            .map(|&id| {
                let repo = repo.clone();
                tokio::spawn(async move { repo.set_current(id).await })
            })
            .collect();
        for h in handles {
            h.await.unwrap().unwrap();
        }

        let state = repo.read().unwrap();
        assert_eq!(state.tournaments.values().filter(|t| t.is_current).count(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_slug_rejected() {
        let repo = InMemoryTournamentRepository::new();
        repo.create_tournament(NewTournament::new(1, "Cup")).await.unwrap();
        let err = repo.create_tournament(NewTournament::new(2, "cup")).await.unwrap_err();
        assert!(matches!(err, RepositoryError::UniqueViolation(_)));
    }

    #[tokio::test]
    async fn test_advance_round_compare_and_set() {
        let repo = InMemoryTournamentRepository::new();
        let t = repo.create_tournament(NewTournament::new(1, "Cup")).await.unwrap();

        assert!(repo.advance_round(t.id, 1, 2).await.unwrap());
        assert!(!repo.advance_round(t.id, 1, 2).await.unwrap());
        assert_eq!(repo.load_tournament(t.id).await.unwrap().unwrap().current_round, 2);
    }

    #[tokio::test]
    async fn test_participant_uniqueness() {
        let repo = InMemoryTournamentRepository::new();
        let t = repo.create_tournament(NewTournament::new(1, "Cup")).await.unwrap();
        let member = Uuid::new_v4();

        repo.insert_participant(t.id, member, 100).await.unwrap();
        assert!(repo.insert_participant(t.id, member, 101).await.is_err());
        assert!(repo.insert_participant(t.id, Uuid::new_v4(), 100).await.is_err());
    }

    #[tokio::test]
    async fn test_open_pair_unique_and_bulk_insert_skips_known_external_ids() {
        let repo = InMemoryTournamentRepository::new();
        let t = repo.create_tournament(NewTournament::new(1, "Cup")).await.unwrap();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let inserted = repo
            .bulk_insert_matches(t.id, &[new_match(10, 1, Some(a), Some(b)), new_match(11, 2, None, None)])
            .await
            .unwrap();
        assert_eq!(inserted.len(), 2);

        let again = repo
            .bulk_insert_matches(t.id, &[new_match(10, 1, Some(a), Some(b))])
            .await
            .unwrap();
        assert!(again.is_empty());

        let err = repo
            .bulk_insert_matches(t.id, &[new_match(12, 2, Some(b), Some(a))])
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::UniqueViolation(_)));

        let open = repo.load_open_match_for_pair(t.id, b, a).await.unwrap().unwrap();
        assert_eq!(open.external_id, 10);
        assert_eq!(repo.max_round(t.id).await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_delete_participant_clears_slots() {
        let repo = InMemoryTournamentRepository::new();
        let t = repo.create_tournament(NewTournament::new(1, "Cup")).await.unwrap();
        let a = repo.insert_participant(t.id, Uuid::new_v4(), 100).await.unwrap();
        let b = repo.insert_participant(t.id, Uuid::new_v4(), 101).await.unwrap();
        let inserted = repo
            .bulk_insert_matches(t.id, &[new_match(10, 1, Some(a.id), Some(b.id))])
            .await
            .unwrap();

        repo.delete_participant(a.id).await.unwrap();

        let m = repo.load_match(inserted[0].id).await.unwrap().unwrap();
        assert_eq!(m.participant1_id, None);
        assert_eq!(m.participant2_id, Some(b.id));
    }

    #[tokio::test]
    async fn test_delete_tournament_cascades() {
        let repo = InMemoryTournamentRepository::new();
        let t = repo.create_tournament(NewTournament::new(1, "Cup")).await.unwrap();
        repo.insert_participant(t.id, Uuid::new_v4(), 100).await.unwrap();
        repo.bulk_insert_matches(t.id, &[new_match(10, 1, None, None)]).await.unwrap();

        repo.delete_tournament(t.id).await.unwrap();

        assert!(repo.list_participants(t.id).await.unwrap().is_empty());
        assert!(repo.list_matches(t.id).await.unwrap().is_empty());
    }
}
