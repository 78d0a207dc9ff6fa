use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

pub mod clock;

pub use clock::{wall_clock_ms, MonoOffset, SessionClock};

pub const WORLD_WIDTH: f32 = 1300.0;
pub const WORLD_HEIGHT: f32 = 650.0;
pub const WORLD_MARGIN: f32 = 200.0;

pub const TICK_RATE_HZ: u32 = 60;
pub const SNAPSHOT_EVERY_TICKS: u64 = 3;
/// Nominal spacing between snapshots in milliseconds (20 Hz).
pub const SNAPSHOT_INTERVAL_MS: f64 = 1000.0 / TICK_RATE_HZ as f64 * SNAPSHOT_EVERY_TICKS as f64;

pub type MatchId = u64;
pub type UserId = u64;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Team {
    #[serde(rename = "team1")]
    Team1,
    #[serde(rename = "team2")]
    Team2,
}

impl Team {
    pub fn opponent(self) -> Team {
        match self {
            Team::Team1 => Team::Team2,
            Team::Team2 => Team::Team1,
        }
    }
}

impl fmt::Display for Team {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Team::Team1 => write!(f, "team1"),
            Team::Team2 => write!(f, "team2"),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AttackType {
    #[default]
    Basic,
    Special,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum RoomStatus {
    Waiting,
    Starting,
    Active,
    Finished,
}

impl fmt::Display for RoomStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RoomStatus::Waiting => "waiting",
            RoomStatus::Starting => "starting",
            RoomStatus::Active => "active",
            RoomStatus::Finished => "finished",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum JoinFailure {
    Unauthorized,
    BadMatchId,
    JoinFailed,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

/// Client-reported movement state.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct InputFrame {
    pub x: f32,
    pub y: f32,
    pub flip: Option<bool>,
    pub animation: Option<String>,
}

impl InputFrame {
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct HitProposal {
    pub attacker: String,
    pub target: String,
    pub attack_type: AttackType,
    pub instance_id: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct HealProposal {
    pub source: Option<String>,
    pub target: String,
    pub ability_type: Option<String>,
}

/// Per-player entry of a snapshot.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PlayerFrame {
    pub x: f32,
    pub y: f32,
    pub flip: bool,
    pub animation: Option<String>,
    pub health: u32,
    pub is_alive: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Snapshot {
    pub tick_id: u64,
    /// Server-monotonic milliseconds since the room clock started.
    pub t_mono: f64,
    /// Wall clock at emission, diagnostics only.
    pub sent_at_wall_ms: u64,
    pub players: HashMap<String, PlayerFrame>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RosterEntry {
    pub name: String,
    pub team: Team,
    pub character: String,
    pub x: f32,
    pub y: f32,
    pub health: u32,
    pub max_health: u32,
    pub super_charge: u32,
    pub max_super_charge: u32,
    pub level: u32,
    pub is_alive: bool,
    pub spawn_index: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct InitState {
    pub match_id: MatchId,
    pub mode: String,
    pub map: String,
    pub your_team: Team,
    pub your_character: String,
    pub spawn_version: u64,
    pub status: RoomStatus,
    pub players: Vec<RosterEntry>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RewardSummary {
    pub username: String,
    pub team: Team,
    pub hits: u32,
    pub damage: u64,
    pub kills: u32,
    pub coins_awarded: u32,
    pub gems_awarded: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct GameOverMeta {
    pub team1_alive: usize,
    pub team2_alive: usize,
    pub rewards: Vec<RewardSummary>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub enum Packet {
    // client -> server
    Connect {
        user_id: UserId,
        name: String,
    },
    Join {
        match_id: MatchId,
    },
    Input(InputFrame),
    Action {
        kind: String,
        data: Vec<u8>,
    },
    Special,
    Hit(HitProposal),
    Heal(HealProposal),
    Ready {
        match_id: MatchId,
    },
    Leave,
    Disconnect,

    // server -> client
    Connected {
        client_id: u32,
    },
    Joined {
        ok: bool,
        match_id: MatchId,
    },
    JoinError {
        code: JoinFailure,
        message: String,
    },
    Init(InitState),
    Starting {
        timeout_ms: u64,
        at: u64,
    },
    Start {
        countdown: u32,
    },
    Snapshot(Snapshot),
    HealthUpdate {
        username: String,
        health: u32,
        max_health: u32,
        match_id: MatchId,
    },
    SuperUpdate {
        username: String,
        charge: u32,
        max_charge: u32,
    },
    PlayerDead {
        username: String,
        match_id: MatchId,
    },
    PlayerSpecial {
        username: String,
        character: String,
        origin: Position,
        flip: bool,
    },
    PlayerAction {
        user_id: UserId,
        name: String,
        origin: Position,
        flip: bool,
        character: String,
        kind: String,
        data: Vec<u8>,
        at: u64,
    },
    PlayerDisconnected {
        name: String,
        players_remaining: usize,
    },
    GameOver {
        match_id: MatchId,
        winner_team: Option<Team>,
        meta: GameOverMeta,
    },
    Disconnected {
        reason: String,
    },
}

/// Clamps a reported position into the world rectangle widened by the margin.
pub fn clamp_to_world(x: f32, y: f32) -> (f32, f32) {
    (
        x.clamp(-WORLD_MARGIN, WORLD_WIDTH + WORLD_MARGIN),
        y.clamp(-WORLD_MARGIN, WORLD_HEIGHT + WORLD_MARGIN),
    )
}

pub fn distance(a: (f32, f32), b: (f32, f32)) -> f32 {
    let dx = a.0 - b.0;
    let dy = a.1 - b.1;
    (dx * dx + dy * dy).sqrt()
}

/// Mean and population standard deviation, used for snapshot spacing
/// diagnostics on both ends.
pub fn mean_and_stdev(samples: &[f64]) -> Option<(f64, f64)> {
    if samples.is_empty() {
        return None;
    }
    let n = samples.len() as f64;
    let mean = samples.iter().sum::<f64>() / n;
    let variance = samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n;
    Some((mean, variance.sqrt()))
}
