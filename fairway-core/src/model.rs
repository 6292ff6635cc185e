//! Trip and user records.
//!
//! Records live inside the `trips` and `users` aggregates. Score arrays
//! are indexed by round: slot `i` holds the strokes for round `i`, or
//! `None` until a score is entered.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::aggregate::Aggregate;

/// Collection holding trips, keyed by trip id.
pub const TRIPS: &str = "trips";

/// Collection holding users, keyed by username.
pub const USERS: &str = "users";

/// Per-round strokes; `None` means not yet played.
pub type ScoreCard = Vec<Option<u32>>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModelError {
    #[error("Round {round} out of range (trip has {rounds} rounds)")]
    RoundOutOfRange { round: usize, rounds: usize },

    #[error("{player} is not on trip {trip}")]
    NotOnTrip { player: String, trip: String },

    #[error("Username {0} is already taken")]
    DuplicateUsername(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Team {
    pub name: String,
    pub players: Vec<String>,
}

/// Pairings for one round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lineup {
    pub round: usize,
    pub groups: Vec<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trip {
    pub id: String,
    pub leader: String,
    pub rounds: usize,
    #[serde(default)]
    pub teams: Vec<Team>,
    #[serde(default)]
    pub lineups: Vec<Lineup>,
    /// Username -> per-round strokes.
    #[serde(default)]
    pub scores: BTreeMap<String, ScoreCard>,
}

impl Trip {
    pub fn new(id: impl Into<String>, leader: impl Into<String>, rounds: usize) -> Self {
        Self {
            id: id.into(),
            leader: leader.into(),
            rounds,
            teams: Vec::new(),
            lineups: Vec::new(),
            scores: BTreeMap::new(),
        }
    }

    /// Add a player with an empty score card. Existing cards are kept.
    pub fn add_player(&mut self, username: &str) {
        let rounds = self.rounds;
        self.scores
            .entry(username.to_string())
            .or_insert_with(|| vec![None; rounds]);
    }

    /// Append a round, growing every player's score card.
    pub fn add_round(&mut self) -> usize {
        self.rounds += 1;
        for card in self.scores.values_mut() {
            card.resize(self.rounds, None);
        }
        self.rounds - 1
    }

    /// Set (or replace) the pairings for a round.
    pub fn set_lineup(&mut self, lineup: Lineup) -> Result<(), ModelError> {
        self.check_round(lineup.round)?;
        self.lineups.retain(|l| l.round != lineup.round);
        self.lineups.push(lineup);
        self.lineups.sort_by_key(|l| l.round);
        Ok(())
    }

    pub fn record_score(&mut self, username: &str, round: usize, strokes: u32) -> Result<(), ModelError> {
        self.check_round(round)?;
        let card = self.scores.get_mut(username).ok_or_else(|| ModelError::NotOnTrip {
            player: username.to_string(),
            trip: self.id.clone(),
        })?;
        let rounds = card.len();
        let slot = card
            .get_mut(round)
            .ok_or(ModelError::RoundOutOfRange { round, rounds })?;
        *slot = Some(strokes);
        Ok(())
    }

    fn check_round(&self, round: usize) -> Result<(), ModelError> {
        if round >= self.rounds {
            return Err(ModelError::RoundOutOfRange {
                round,
                rounds: self.rounds,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    /// Unique and case-sensitive; also the record id.
    pub username: String,
    pub password_hash: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub handicap: Option<f32>,
    /// Trip id -> this user's per-round strokes.
    #[serde(default)]
    pub trips: BTreeMap<String, ScoreCard>,
}

impl User {
    pub fn new(username: impl Into<String>, password_hash: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password_hash: password_hash.into(),
            display_name: None,
            handicap: None,
            trips: BTreeMap::new(),
        }
    }

    /// Give the user a score card sized to the trip's current round count.
    ///
    /// Joining a trip twice keeps the existing card.
    pub fn join_trip(&mut self, trip: &Trip) {
        self.trips
            .entry(trip.id.clone())
            .or_insert_with(|| vec![None; trip.rounds]);
    }

    pub fn record_score(&mut self, trip_id: &str, round: usize, strokes: u32) -> Result<(), ModelError> {
        let card = self.trips.get_mut(trip_id).ok_or_else(|| ModelError::NotOnTrip {
            player: self.username.clone(),
            trip: trip_id.to_string(),
        })?;
        let rounds = card.len();
        let slot = card
            .get_mut(round)
            .ok_or(ModelError::RoundOutOfRange { round, rounds })?;
        *slot = Some(strokes);
        Ok(())
    }

    /// Total strokes over the rounds played on a trip.
    pub fn total_for(&self, trip_id: &str) -> Option<u32> {
        self.trips
            .get(trip_id)
            .map(|card| card.iter().flatten().sum())
    }
}

/// Insert a new user into the `users` aggregate.
pub fn register_user(users: &mut Aggregate, user: &User) -> anyhow::Result<()> {
    if users.contains(&user.username) {
        return Err(ModelError::DuplicateUsername(user.username.clone()).into());
    }
    users.insert_record(user.username.clone(), user)?;
    Ok(())
}
