//! Out-of-combat health regeneration, run once per room tick.

use crate::player::PlayerState;
use shared::UserId;

#[derive(Debug, Clone)]
pub struct RegenConfig {
    /// Idle time (no attack given or received) before regen starts.
    pub delay_ms: f64,
    /// Spacing between discrete heals.
    pub interval_ms: f64,
    pub missing_ratio: f64,
    pub min_amount: u32,
    /// Minimum spacing between health broadcasts for one player.
    pub broadcast_min_ms: f64,
}

impl Default for RegenConfig {
    fn default() -> Self {
        Self {
            delay_ms: 3500.0,
            interval_ms: 1500.0,
            missing_ratio: 0.25,
            min_amount: 500,
            broadcast_min_ms: 120.0,
        }
    }
}

/// Heal for one regen step: the larger of the fixed minimum and a fraction of
/// the missing health, rounded up to a multiple of 100, capped at `missing`.
pub fn regen_amount(missing: u32, config: &RegenConfig) -> u32 {
    if missing == 0 {
        return 0;
    }
    let by_ratio = (missing as f64 * config.missing_ratio).ceil() as u32;
    let desired = config.min_amount.max(by_ratio);
    let rounded = desired.div_ceil(100) * 100;
    rounded.min(missing)
}

/// True when a health update for `player` may go out now. Reaching full
/// health always broadcasts.
pub fn may_broadcast(player: &PlayerState, now: f64, config: &RegenConfig) -> bool {
    if player.health() == player.max_health() {
        return true;
    }
    match player.last_health_broadcast_at {
        Some(last) => now - last >= config.broadcast_min_ms,
        None => true,
    }
}

/// Applies one regen pass. Returns the players whose new health should be
/// broadcast.
pub fn process_regen<'a>(
    players: impl Iterator<Item = &'a mut PlayerState>,
    now: f64,
    config: &RegenConfig,
) -> Vec<UserId> {
    let mut changed = Vec::new();

    for player in players {
        if !player.is_alive() || player.missing_health() == 0 {
            continue;
        }
        if now - player.last_combat_at < config.delay_ms {
            continue;
        }
        if now < player.regen_next_at {
            continue;
        }

        let amount = regen_amount(player.missing_health(), config);
        let applied = player.restore(amount);
        player.regen_next_at = now + config.interval_ms;

        if applied > 0 && may_broadcast(player, now, config) {
            changed.push(player.user_id);
        }
    }

    changed
}
