//! Per-match combat tallies and the currency formula applied at game over.

use crate::config::RuntimeOverrides;
use shared::{RewardSummary, Team, UserId};
use std::collections::BTreeMap;

const BASE_COINS: u32 = 40;
const COINS_PER_HIT: u32 = 2;
const DAMAGE_PER_COIN: u64 = 150;
const COINS_PER_KILL: u32 = 25;
const WIN_BONUS: u32 = 40;
const DRAW_BONUS: u32 = 25;
const LOSS_BONUS: u32 = 15;

/// Combat tally of one participant, accumulated over the match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewardBucket {
    pub username: String,
    pub team: Team,
    pub hits: u32,
    pub damage: u64,
    pub kills: u32,
}

impl RewardBucket {
    pub fn new(username: &str, team: Team) -> Self {
        Self {
            username: username.to_string(),
            team,
            hits: 0,
            damage: 0,
            kills: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reward {
    pub coins: u32,
    pub gems: u32,
}

/// A reward that still has to be written to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credit {
    pub user_id: UserId,
    pub coins: u32,
    pub gems: u32,
}

/// Buckets for everyone who was ever in the room, keyed by user id so the
/// game-over summary comes out in a stable order.
#[derive(Debug, Default)]
pub struct RewardLedger {
    buckets: BTreeMap<UserId, RewardBucket>,
}

impl RewardLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the bucket on first sight and refreshes name and team after.
    pub fn ensure(&mut self, user_id: UserId, username: &str, team: Team) -> &mut RewardBucket {
        let bucket = self
            .buckets
            .entry(user_id)
            .or_insert_with(|| RewardBucket::new(username, team));
        bucket.team = team;
        if bucket.username != username {
            bucket.username = username.to_string();
        }
        bucket
    }

    pub fn get(&self, user_id: UserId) -> Option<&RewardBucket> {
        self.buckets.get(&user_id)
    }

    pub fn record_hit(&mut self, user_id: UserId) {
        if let Some(bucket) = self.buckets.get_mut(&user_id) {
            bucket.hits += 1;
        }
    }

    pub fn record_damage(&mut self, user_id: UserId, damage: u32) {
        if let Some(bucket) = self.buckets.get_mut(&user_id) {
            bucket.damage += damage as u64;
        }
    }

    pub fn record_kill(&mut self, user_id: UserId) {
        if let Some(bucket) = self.buckets.get_mut(&user_id) {
            bucket.kills += 1;
        }
    }

    /// Computes every participant's reward for the final outcome. Returns the
    /// public summary plus the credits to persist.
    pub fn settle(
        &self,
        winner: Option<Team>,
        overrides: &RuntimeOverrides,
    ) -> (Vec<RewardSummary>, Vec<Credit>) {
        let mut summary = Vec::with_capacity(self.buckets.len());
        let mut credits = Vec::new();

        for (&user_id, bucket) in &self.buckets {
            let reward = calculate_reward(bucket, winner, overrides);
            summary.push(RewardSummary {
                username: bucket.username.clone(),
                team: bucket.team,
                hits: bucket.hits,
                damage: bucket.damage,
                kills: bucket.kills,
                coins_awarded: reward.coins,
                gems_awarded: reward.gems,
            });
            if reward.coins > 0 || reward.gems > 0 {
                credits.push(Credit {
                    user_id,
                    coins: reward.coins,
                    gems: reward.gems,
                });
            }
        }

        (summary, credits)
    }
}

/// Usable multiplier: non-finite or non-positive values count as 1.
fn multiplier(value: f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        1.0
    }
}

pub fn calculate_reward(
    bucket: &RewardBucket,
    winner: Option<Team>,
    overrides: &RuntimeOverrides,
) -> Reward {
    let won = winner == Some(bucket.team);
    let outcome_bonus = match winner {
        None => DRAW_BONUS,
        Some(_) if won => WIN_BONUS,
        Some(_) => LOSS_BONUS,
    };

    let coins = BASE_COINS as u64
        + (bucket.hits * COINS_PER_HIT) as u64
        + bucket.damage / DAMAGE_PER_COIN
        + (bucket.kills * COINS_PER_KILL) as u64
        + outcome_bonus as u64;

    let mut gems = 0u32;
    if won {
        gems += 10;
    }
    if bucket.kills >= 1 {
        gems += 5;
    }
    if bucket.kills >= 2 {
        gems += 20;
    }
    if bucket.damage >= 10_000 {
        gems += 10;
    }
    if bucket.damage >= 15_000 {
        gems += 5;
    }

    let multipliers = &overrides.reward_multipliers;
    let coins = coins as f64 * multiplier(multipliers.coins);
    let gems = (gems as f64 * multiplier(multipliers.gems)).round() as u32;

    let floor = if overrides.reward_floor > 0 { overrides.reward_floor } else { 5 };
    let ceiling = if overrides.reward_ceiling > 0 { overrides.reward_ceiling } else { 500 };
    let coins = (coins.round() as u32).min(ceiling).max(floor);

    Reward { coins, gems }
}
