//! Authoritative per-participant state inside a room.

use crate::characters::CombatStats;
use crate::store::MatchParticipant;
use shared::{clamp_to_world, InputFrame, PlayerFrame, Position, Team, UserId};

const SPAWN_X: f32 = 400.0;
const SPAWN_Y: f32 = 400.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DamageResult {
    /// Health actually removed (never more than the health the target had).
    pub applied: u32,
    /// True only on the alive -> dead transition.
    pub killed: bool,
}

#[derive(Debug, Clone)]
pub struct PlayerState {
    pub user_id: UserId,
    pub name: String,
    pub team: Team,
    pub character: String,
    pub level: u32,

    pub x: f32,
    pub y: f32,
    pub flip: bool,
    pub animation: Option<String>,

    health: u32,
    max_health: u32,
    super_charge: u32,
    max_super_charge: u32,
    is_alive: bool,

    pub base_damage: u32,
    pub special_damage: u32,

    pub last_attack_at: f64,
    pub last_damaged_at: f64,
    pub last_combat_at: f64,
    pub regen_next_at: f64,
    pub last_health_broadcast_at: Option<f64>,

    /// Latest reported movement, consumed at the next tick boundary.
    pub pending_input: Option<InputFrame>,
    pub last_input_at: f64,
    pub connected: bool,
}

impl PlayerState {
    pub fn new(participant: &MatchParticipant, level: u32, stats: CombatStats, now: f64) -> Self {
        Self {
            user_id: participant.user_id,
            name: participant.name.clone(),
            team: participant.team,
            character: participant.character.clone(),
            level,
            x: SPAWN_X,
            y: SPAWN_Y,
            flip: false,
            animation: None,
            health: stats.max_health,
            max_health: stats.max_health,
            super_charge: 0,
            max_super_charge: stats.max_super_charge,
            is_alive: true,
            base_damage: stats.base_damage,
            special_damage: stats.special_damage,
            last_attack_at: 0.0,
            last_damaged_at: 0.0,
            // Joining counts as combat so regen does not kick in immediately.
            last_combat_at: now,
            regen_next_at: 0.0,
            last_health_broadcast_at: None,
            pending_input: None,
            last_input_at: now,
            connected: true,
        }
    }

    pub fn health(&self) -> u32 {
        self.health
    }

    pub fn max_health(&self) -> u32 {
        self.max_health
    }

    pub fn missing_health(&self) -> u32 {
        self.max_health - self.health
    }

    pub fn super_charge(&self) -> u32 {
        self.super_charge
    }

    pub fn max_super_charge(&self) -> u32 {
        self.max_super_charge
    }

    pub fn is_alive(&self) -> bool {
        self.is_alive
    }

    pub fn position(&self) -> (f32, f32) {
        (self.x, self.y)
    }

    pub fn origin(&self) -> Position {
        Position {
            x: self.x,
            y: self.y,
        }
    }

    /// Removes up to `amount` health, flooring at zero. Dead players are
    /// untouched.
    pub fn apply_damage(&mut self, amount: u32) -> DamageResult {
        if !self.is_alive {
            return DamageResult {
                applied: 0,
                killed: false,
            };
        }
        let applied = amount.min(self.health);
        self.health -= applied;
        let killed = self.health == 0;
        if killed {
            self.is_alive = false;
        }
        DamageResult { applied, killed }
    }

    /// Adds up to `amount` health without exceeding the maximum. Returns the
    /// amount restored; dead players cannot be healed.
    pub fn restore(&mut self, amount: u32) -> u32 {
        if !self.is_alive {
            return 0;
        }
        let applied = amount.min(self.missing_health());
        self.health += applied;
        applied
    }

    /// Adds to the super-charge meter, clamped to its maximum.
    pub fn add_charge(&mut self, amount: u32) -> u32 {
        self.super_charge = self
            .super_charge
            .saturating_add(amount)
            .min(self.max_super_charge);
        self.super_charge
    }

    pub fn charge_full(&self) -> bool {
        self.max_super_charge > 0 && self.super_charge >= self.max_super_charge
    }

    pub fn reset_charge(&mut self) {
        self.super_charge = 0;
    }

    pub fn mark_combat(&mut self, now: f64) {
        self.last_combat_at = now;
    }

    /// Applies the buffered input, if any. Positions are clamped to the world
    /// bounds plus margin.
    pub fn integrate_input(&mut self) -> bool {
        let Some(input) = self.pending_input.take() else {
            return false;
        };
        if !self.is_alive {
            return false;
        }
        let (x, y) = clamp_to_world(input.x, input.y);
        self.x = x;
        self.y = y;
        if let Some(flip) = input.flip {
            self.flip = flip;
        }
        if input.animation.is_some() {
            self.animation = input.animation;
        }
        true
    }

    pub fn frame(&self) -> PlayerFrame {
        PlayerFrame {
            x: self.x,
            y: self.y,
            flip: self.flip,
            animation: self.animation.clone(),
            health: self.health,
            is_alive: self.is_alive,
        }
    }
}
