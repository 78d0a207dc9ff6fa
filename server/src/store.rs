//! Persistence boundary: match rosters, character levels and currency.
//!
//! The room core only ever talks to `MatchStore`. `MemoryStore` backs the
//! binary and the tests; it can be seeded from a JSON roster file.

use async_trait::async_trait;
use log::info;
use serde::{Deserialize, Serialize};
use shared::{MatchId, Team, UserId};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Unknown match: {0}")]
    UnknownMatch(MatchId),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchParticipant {
    pub user_id: UserId,
    pub name: String,
    pub team: Team,
    #[serde(alias = "char_class")]
    pub character: String,
    #[serde(default)]
    pub party_id: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchData {
    pub mode: String,
    pub map: String,
    pub players: Vec<MatchParticipant>,
}

impl MatchData {
    pub fn participant(&self, user_id: UserId) -> Option<&MatchParticipant> {
        self.players.iter().find(|p| p.user_id == user_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchStatus {
    Live,
    Completed,
}

#[async_trait]
pub trait MatchStore: Send + Sync {
    /// Returns the roster of a match that is currently live.
    async fn load_match(&self, match_id: MatchId) -> Result<Option<MatchData>, StoreError>;

    /// Persisted level of a user's character class; 1 when unknown.
    async fn character_level(&self, user_id: UserId, character: &str) -> Result<u32, StoreError>;

    async fn complete_match(&self, match_id: MatchId) -> Result<(), StoreError>;

    /// Adds a currency delta to a user's balance.
    async fn credit_currency(&self, user_id: UserId, coins: u32, gems: u32)
        -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Wallet {
    pub coins: u64,
    pub gems: u64,
}

#[derive(Debug, Deserialize)]
struct SeedMatch {
    match_id: MatchId,
    mode: String,
    map: String,
    #[serde(default = "SeedMatch::live")]
    status: MatchStatus,
    players: Vec<MatchParticipant>,
}

impl SeedMatch {
    fn live() -> MatchStatus {
        MatchStatus::Live
    }
}

#[derive(Debug, Deserialize)]
struct SeedFile {
    matches: Vec<SeedMatch>,
    #[serde(default)]
    levels: Vec<SeedLevel>,
}

#[derive(Debug, Deserialize)]
struct SeedLevel {
    user_id: UserId,
    character: String,
    level: u32,
}

#[derive(Debug, Default)]
struct MemoryState {
    matches: HashMap<MatchId, (MatchStatus, MatchData)>,
    levels: HashMap<(UserId, String), u32>,
    wallets: HashMap<UserId, Wallet>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads `{"matches": [...], "levels": [...]}` from disk.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let text = std::fs::read_to_string(path)?;
        let seed: SeedFile = serde_json::from_str(&text)?;

        let mut state = MemoryState::default();
        for m in seed.matches {
            state.matches.insert(
                m.match_id,
                (
                    m.status,
                    MatchData {
                        mode: m.mode,
                        map: m.map,
                        players: m.players,
                    },
                ),
            );
        }
        for l in seed.levels {
            state.levels.insert((l.user_id, l.character), l.level);
        }
        info!("Loaded {} matches into memory store", state.matches.len());

        Ok(Self {
            state: RwLock::new(state),
            fail_writes: AtomicBool::new(false),
        })
    }

    pub async fn insert_match(&self, match_id: MatchId, status: MatchStatus, data: MatchData) {
        self.state
            .write()
            .await
            .matches
            .insert(match_id, (status, data));
    }

    pub async fn set_level(&self, user_id: UserId, character: &str, level: u32) {
        self.state
            .write()
            .await
            .levels
            .insert((user_id, character.to_string()), level);
    }

    pub async fn wallet(&self, user_id: UserId) -> Wallet {
        self.state
            .read()
            .await
            .wallets
            .get(&user_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn match_status(&self, match_id: MatchId) -> Option<MatchStatus> {
        self.state
            .read()
            .await
            .matches
            .get(&match_id)
            .map(|(status, _)| *status)
    }

    /// Makes every subsequent write fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("writes disabled".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl MatchStore for MemoryStore {
    async fn load_match(&self, match_id: MatchId) -> Result<Option<MatchData>, StoreError> {
        let state = self.state.read().await;
        Ok(match state.matches.get(&match_id) {
            Some((MatchStatus::Live, data)) => Some(data.clone()),
            _ => None,
        })
    }

    async fn character_level(&self, user_id: UserId, character: &str) -> Result<u32, StoreError> {
        let state = self.state.read().await;
        let level = state
            .levels
            .get(&(user_id, character.to_string()))
            .copied()
            .unwrap_or(1);
        Ok(level.max(1))
    }

    async fn complete_match(&self, match_id: MatchId) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut state = self.state.write().await;
        let entry = state
            .matches
            .get_mut(&match_id)
            .ok_or(StoreError::UnknownMatch(match_id))?;
        entry.0 = MatchStatus::Completed;
        Ok(())
    }

    async fn credit_currency(
        &self,
        user_id: UserId,
        coins: u32,
        gems: u32,
    ) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut state = self.state.write().await;
        let wallet = state.wallets.entry(user_id).or_default();
        wallet.coins += coins as u64;
        wallet.gems += gems as u64;
        Ok(())
    }
}
