//! Server-side validation and application of client-proposed hits and heals.
//!
//! Clients only ever propose who hit whom and with what kind of attack. The
//! amount always comes from the stats computed at join time, and every
//! proposal must pass the checks in [`CombatResolver::propose_hit`] before
//! any state changes.

use crate::player::PlayerState;
use log::debug;
use shared::{distance, AttackType, HealProposal, HitProposal, UserId};
use std::collections::HashMap;
use std::fmt;

/// Dedup entries older than this many windows are dropped on insert.
const DEDUP_PRUNE_FACTOR: f64 = 10.0;
const DEDUP_PRUNE_THRESHOLD: usize = 256;

#[derive(Debug, Clone)]
pub struct CombatConfig {
    pub dedup_window_ms: f64,
    pub basic_range: f32,
    pub special_range: f32,
    /// Heal amount as a fraction of the healer's basic damage.
    pub heal_factor: f64,
}

impl Default for CombatConfig {
    fn default() -> Self {
        Self {
            dedup_window_ms: 80.0,
            basic_range: 850.0,
            special_range: 1000.0,
            heal_factor: 0.5,
        }
    }
}

impl CombatConfig {
    pub fn range(&self, attack_type: AttackType) -> f32 {
        match attack_type {
            AttackType::Basic => self.basic_range,
            AttackType::Special => self.special_range,
        }
    }
}

/// Why a proposal was dropped. Never sent to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejected {
    UnknownPlayer,
    NotAlive,
    SameTeam,
    OutOfRange,
    Duplicate,
    NoEffect,
}

impl fmt::Display for Rejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Rejected::UnknownPlayer => "unknown player",
            Rejected::NotAlive => "participant not alive",
            Rejected::SameTeam => "same team",
            Rejected::OutOfRange => "out of range",
            Rejected::Duplicate => "duplicate",
            Rejected::NoEffect => "no effect",
        };
        f.write_str(reason)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HitOutcome {
    pub attacker: UserId,
    pub target: UserId,
    pub self_hit: bool,
    /// Health actually removed from the target.
    pub applied: u32,
    /// Target went from alive to dead with this hit.
    pub killed: bool,
    /// Attacker's new super-charge, when it changed.
    pub charge: Option<u32>,
}

impl HitOutcome {
    /// Kills are only credited for hits on someone else.
    pub fn credits_kill(&self) -> bool {
        self.killed && !self.self_hit
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealOutcome {
    pub target: UserId,
    pub applied: u32,
}

pub fn find_by_name(players: &HashMap<UserId, PlayerState>, name: &str) -> Option<UserId> {
    players
        .values()
        .find(|player| player.name == name)
        .map(|player| player.user_id)
}

#[derive(Debug, Default)]
pub struct CombatResolver {
    config: CombatConfig,
    /// `attacker|target|attack type` -> time of the last accepted hit.
    recent_hits: HashMap<(UserId, UserId, AttackType), f64>,
}

impl CombatResolver {
    pub fn new(config: CombatConfig) -> Self {
        Self {
            config,
            recent_hits: HashMap::new(),
        }
    }

    /// Validates and applies a hit proposal.
    ///
    /// Non-self hits must be between living members of opposing teams, within
    /// the attack type's range, and outside the dedup window of the previous
    /// accepted hit with the same attacker, target and attack type. Self-hits
    /// (falling out of the world) skip the team, range and dedup checks.
    pub fn propose_hit(
        &mut self,
        players: &mut HashMap<UserId, PlayerState>,
        proposal: &HitProposal,
        now: f64,
    ) -> Result<HitOutcome, Rejected> {
        let attacker_id =
            find_by_name(players, proposal.attacker.trim()).ok_or(Rejected::UnknownPlayer)?;
        let target_id =
            find_by_name(players, proposal.target.trim()).ok_or(Rejected::UnknownPlayer)?;
        let self_hit = attacker_id == target_id;

        let (attacker_team, attacker_pos, damage) = {
            let attacker = players.get(&attacker_id).ok_or(Rejected::UnknownPlayer)?;
            if !attacker.is_alive() {
                return Err(Rejected::NotAlive);
            }
            let damage = match proposal.attack_type {
                AttackType::Basic => attacker.base_damage,
                AttackType::Special => attacker.special_damage,
            };
            (attacker.team, attacker.position(), damage)
        };

        {
            let target = players.get(&target_id).ok_or(Rejected::UnknownPlayer)?;
            if !target.is_alive() {
                return Err(Rejected::NotAlive);
            }
            if !self_hit {
                if target.team == attacker_team {
                    return Err(Rejected::SameTeam);
                }
                if damage > 0
                    && distance(attacker_pos, target.position())
                        > self.config.range(proposal.attack_type)
                {
                    return Err(Rejected::OutOfRange);
                }
            }
        }

        if damage == 0 {
            return Err(Rejected::NoEffect);
        }

        if !self_hit {
            let key = (attacker_id, target_id, proposal.attack_type);
            if let Some(last) = self.recent_hits.get(&key) {
                if now - last < self.config.dedup_window_ms {
                    return Err(Rejected::Duplicate);
                }
            }
            self.remember(key, now);
        }

        let result = match players.get_mut(&target_id) {
            Some(target) => {
                let result = target.apply_damage(damage);
                target.last_damaged_at = now;
                target.mark_combat(now);
                result
            }
            None => return Err(Rejected::UnknownPlayer),
        };

        let mut charge = None;
        if let Some(attacker) = players.get_mut(&attacker_id) {
            attacker.last_attack_at = now;
            attacker.mark_combat(now);
            if !self_hit && result.applied > 0 && attacker.max_super_charge() > 0 {
                charge = Some(attacker.add_charge(result.applied));
            }
        }

        Ok(HitOutcome {
            attacker: attacker_id,
            target: target_id,
            self_hit,
            applied: result.applied,
            killed: result.killed,
            charge,
        })
    }

    /// Validates and applies a heal. The healer defaults to `sender` when the
    /// proposal names no source; the amount is a fraction of the healer's
    /// basic damage, capped at the target's missing health.
    pub fn propose_heal(
        &self,
        players: &mut HashMap<UserId, PlayerState>,
        sender: UserId,
        proposal: &HealProposal,
        now: f64,
    ) -> Result<HealOutcome, Rejected> {
        let source_id = match proposal.source.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => {
                find_by_name(players, name).ok_or(Rejected::UnknownPlayer)?
            }
            _ => sender,
        };
        let target_id =
            find_by_name(players, proposal.target.trim()).ok_or(Rejected::UnknownPlayer)?;

        let (source_team, base_damage) = {
            let source = players.get(&source_id).ok_or(Rejected::UnknownPlayer)?;
            if !source.is_alive() {
                return Err(Rejected::NotAlive);
            }
            (source.team, source.base_damage)
        };

        let target = players.get_mut(&target_id).ok_or(Rejected::UnknownPlayer)?;
        if !target.is_alive() {
            return Err(Rejected::NotAlive);
        }
        if source_id != target_id && source_team != target.team {
            return Err(Rejected::SameTeam);
        }

        let amount = (base_damage as f64 * self.config.heal_factor).round() as u32;
        let amount = amount.min(target.missing_health());
        if amount == 0 {
            return Err(Rejected::NoEffect);
        }

        let applied = target.restore(amount);
        target.mark_combat(now);
        debug!("{} healed {} for {}", source_id, target.name, applied);

        Ok(HealOutcome {
            target: target_id,
            applied,
        })
    }

    fn remember(&mut self, key: (UserId, UserId, AttackType), now: f64) {
        if self.recent_hits.len() >= DEDUP_PRUNE_THRESHOLD {
            let horizon = self.config.dedup_window_ms * DEDUP_PRUNE_FACTOR;
            self.recent_hits.retain(|_, at| now - *at < horizon);
        }
        self.recent_hits.insert(key, now);
    }
}
