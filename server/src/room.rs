//! One match's authoritative state and lifecycle.
//!
//! `SessionRoom` is synchronous and owns everything about a match: roster,
//! start handshake, fixed-step loop, combat, regen and rewards. Every entry
//! point takes the room clock in milliseconds and queues outgoing packets in
//! an outbox, so the room never blocks and can be driven deterministically.
//! The async driver in `hub` feeds it commands and timer wake-ups and hands
//! the outbox to the network layer.
//!
//! Lifecycle: `Waiting` until every rostered participant has joined,
//! `Starting` while clients load and acknowledge readiness, `Active` while
//! the loop runs, `Finished` once a team is eliminated. A finished room stays
//! addressable for a grace period before the hub tears it down.

use crate::characters::compute_stats;
use crate::combat::{CombatResolver, HealOutcome, HitOutcome};
use crate::config::{RoomConfig, RuntimeConfig};
use crate::player::PlayerState;
use crate::regen::process_regen;
use crate::rewards::{Credit, RewardLedger};
use crate::store::{MatchData, StoreError};
use crate::tick::FixedStep;
use log::{debug, info};
use shared::{
    mean_and_stdev, wall_clock_ms, GameOverMeta, HealProposal, HitProposal, InitState,
    InputFrame, JoinFailure, MatchId, Packet, RoomStatus, RosterEntry, Snapshot, Team, UserId,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use thiserror::Error;

/// Snapshot spacings kept for the timing diagnostics.
const SPACING_SAMPLES: usize = 60;

#[derive(Debug, Error)]
pub enum JoinError {
    #[error("Connection is not identified")]
    Unidentified,

    #[error("Match ID required")]
    InvalidMatchId,

    #[error("Game room {0} not found")]
    NotFound(MatchId),

    #[error("User {0} is not a participant in this match")]
    NotParticipant(UserId),

    #[error("Game room {0} is closed")]
    Closed(MatchId),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl JoinError {
    /// Code reported to the client in `Packet::JoinError`.
    pub fn code(&self) -> JoinFailure {
        match self {
            JoinError::Unidentified => JoinFailure::Unauthorized,
            JoinError::InvalidMatchId => JoinFailure::BadMatchId,
            JoinError::NotFound(_)
            | JoinError::NotParticipant(_)
            | JoinError::Closed(_)
            | JoinError::Store(_) => JoinFailure::JoinFailed,
        }
    }
}

/// Who an outgoing packet is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    /// Every connected member of the room.
    Room,
    Only(UserId),
    /// Every connected member except this one.
    Others(UserId),
}

#[derive(Debug, Clone)]
pub struct Envelope {
    pub audience: Audience,
    pub packet: Packet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined,
    Reconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartReason {
    AllAcks,
    Timeout,
}

impl fmt::Display for StartReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartReason::AllAcks => f.write_str("all_acks"),
            StartReason::Timeout => f.write_str("timeout"),
        }
    }
}

/// Persistence work produced when a match finishes.
#[derive(Debug, Clone, PartialEq)]
pub struct Settlement {
    pub match_id: MatchId,
    pub winner: Option<Team>,
    pub credits: Vec<Credit>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoomSummary {
    pub match_id: MatchId,
    pub connected: usize,
    pub status: RoomStatus,
    pub uptime_ms: f64,
}

pub struct SessionRoom {
    match_id: MatchId,
    data: MatchData,
    config: RoomConfig,
    runtime: RuntimeConfig,

    status: RoomStatus,
    created_at: f64,
    spawn_version: u64,
    players: HashMap<UserId, PlayerState>,

    required: HashSet<UserId>,
    acks: HashSet<UserId>,
    start_deadline: Option<f64>,

    loop_start_at: Option<f64>,
    stepper: Option<FixedStep>,
    tick_id: u64,

    combat: CombatResolver,
    ledger: RewardLedger,
    settlement: Option<Settlement>,
    teardown_at: Option<f64>,

    outbox: Vec<Envelope>,

    last_snapshot_at: Option<f64>,
    spacing: VecDeque<f64>,
    last_diag_at: f64,
}

impl SessionRoom {
    pub fn new(
        match_id: MatchId,
        data: MatchData,
        config: RoomConfig,
        runtime: RuntimeConfig,
        now: f64,
    ) -> Self {
        info!(
            "[Room {}] Created for mode {}, map {} ({} participants)",
            match_id,
            data.mode,
            data.map,
            data.players.len()
        );
        let required = data.players.iter().map(|p| p.user_id).collect();
        let combat = CombatResolver::new(config.combat.clone());

        Self {
            match_id,
            data,
            config,
            runtime,
            status: RoomStatus::Waiting,
            created_at: now,
            spawn_version: wall_clock_ms(),
            players: HashMap::new(),
            required,
            acks: HashSet::new(),
            start_deadline: None,
            loop_start_at: None,
            stepper: None,
            tick_id: 0,
            combat,
            ledger: RewardLedger::new(),
            settlement: None,
            teardown_at: None,
            outbox: Vec::new(),
            last_snapshot_at: None,
            spacing: VecDeque::with_capacity(SPACING_SAMPLES),
            last_diag_at: now,
        }
    }

    pub fn match_id(&self) -> MatchId {
        self.match_id
    }

    pub fn status(&self) -> RoomStatus {
        self.status
    }

    pub fn tick_id(&self) -> u64 {
        self.tick_id
    }

    pub fn player(&self, user_id: UserId) -> Option<&PlayerState> {
        self.players.get(&user_id)
    }

    pub fn player_mut(&mut self, user_id: UserId) -> Option<&mut PlayerState> {
        self.players.get_mut(&user_id)
    }

    pub fn ledger(&self) -> &RewardLedger {
        &self.ledger
    }

    pub fn connected_count(&self) -> usize {
        self.players.values().filter(|p| p.connected).count()
    }

    /// No member is connected any more.
    pub fn is_empty(&self) -> bool {
        self.connected_count() == 0
    }

    pub fn is_torn_down(&self, now: f64) -> bool {
        self.teardown_at.is_some_and(|at| now >= at)
    }

    pub fn summary(&self, now: f64) -> RoomSummary {
        RoomSummary {
            match_id: self.match_id,
            connected: self.connected_count(),
            status: self.status,
            uptime_ms: now - self.created_at,
        }
    }

    /// Living players per team.
    pub fn alive_counts(&self) -> (usize, usize) {
        let mut counts = (0, 0);
        for player in self.players.values().filter(|p| p.is_alive()) {
            match player.team {
                Team::Team1 => counts.0 += 1,
                Team::Team2 => counts.1 += 1,
            }
        }
        counts
    }

    /// Adds a rostered participant or rebinds a returning one. `level` is the
    /// persisted level of the participant's character, fetched by the caller.
    pub fn join(
        &mut self,
        user_id: UserId,
        level: u32,
        now: f64,
    ) -> Result<JoinOutcome, JoinError> {
        if self.is_torn_down(now) {
            return Err(JoinError::Closed(self.match_id));
        }
        let participant = self
            .data
            .participant(user_id)
            .cloned()
            .ok_or(JoinError::NotParticipant(user_id))?;

        let outcome = match self.players.get_mut(&user_id) {
            Some(player) => {
                player.connected = true;
                player.pending_input = None;
                player.last_input_at = now;
                info!("[Room {}] Player {} reconnected", self.match_id, player.name);
                JoinOutcome::Reconnected
            }
            None => {
                let stats = compute_stats(&participant.character, level);
                let player = PlayerState::new(&participant, level, stats, now);
                self.players.insert(user_id, player);
                info!(
                    "[Room {}] Player {} joined ({}/{})",
                    self.match_id,
                    participant.name,
                    self.players.len(),
                    self.required.len()
                );
                JoinOutcome::Joined
            }
        };

        if let Some(player) = self.players.get(&user_id) {
            self.ledger.ensure(user_id, &player.name, player.team);
        }

        self.push(
            Audience::Only(user_id),
            Packet::Joined {
                ok: true,
                match_id: self.match_id,
            },
        );
        if let Some(init) = self.init_state(user_id) {
            self.push(Audience::Only(user_id), Packet::Init(init));
        }

        let everyone_here = self.required.iter().all(|id| self.players.contains_key(id));
        if self.status == RoomStatus::Waiting && everyone_here {
            self.begin_starting(now);
        }

        Ok(outcome)
    }

    /// Stops a member contributing input. State is kept for reconnection.
    pub fn leave(&mut self, user_id: UserId) -> bool {
        let Some(player) = self.players.get_mut(&user_id) else {
            return false;
        };
        if !player.connected {
            return false;
        }
        player.connected = false;
        player.pending_input = None;
        let name = player.name.clone();

        let remaining = self.connected_count();
        info!(
            "[Room {}] Player {} left ({} remaining)",
            self.match_id, name, remaining
        );

        if self.status == RoomStatus::Active {
            self.push(
                Audience::Room,
                Packet::PlayerDisconnected {
                    name,
                    players_remaining: remaining,
                },
            );
        }
        true
    }

    /// Buffers the latest movement report; it is applied at the next tick.
    pub fn submit_input(&mut self, user_id: UserId, input: InputFrame, now: f64) -> bool {
        if !input.is_finite() {
            return false;
        }
        match self.players.get_mut(&user_id) {
            Some(player) if player.connected && player.is_alive() => {
                player.pending_input = Some(input);
                player.last_input_at = now;
                true
            }
            _ => false,
        }
    }

    /// Relays an opaque attack/ability declaration to the room with the
    /// sender's authoritative origin and facing.
    pub fn relay_action(&mut self, user_id: UserId, kind: &str, data: Vec<u8>, now: f64) -> bool {
        let kind = kind.trim();
        if kind.is_empty() {
            return false;
        }
        let Some(player) = self.players.get_mut(&user_id) else {
            return false;
        };
        if !player.connected || !player.is_alive() {
            return false;
        }
        // An attack that misses still pauses regen.
        player.mark_combat(now);

        let packet = Packet::PlayerAction {
            user_id,
            name: player.name.clone(),
            origin: player.origin(),
            flip: player.flip,
            character: player.character.clone(),
            kind: kind.to_string(),
            data,
            at: wall_clock_ms(),
        };
        self.push(Audience::Room, packet);
        true
    }

    /// Spends a full super-charge meter.
    pub fn activate_special(&mut self, user_id: UserId) -> bool {
        if self.status != RoomStatus::Active {
            return false;
        }
        let Some(player) = self.players.get_mut(&user_id) else {
            return false;
        };
        if !player.is_alive() || !player.charge_full() {
            return false;
        }
        player.reset_charge();

        let reset = Packet::SuperUpdate {
            username: player.name.clone(),
            charge: 0,
            max_charge: player.max_super_charge(),
        };
        let special = Packet::PlayerSpecial {
            username: player.name.clone(),
            character: player.character.clone(),
            origin: player.origin(),
            flip: player.flip,
        };
        self.push(Audience::Room, reset);
        self.push(Audience::Room, special);
        true
    }

    /// Applies a hit proposal from `sender`. Rejections are silent.
    pub fn handle_hit(
        &mut self,
        sender: UserId,
        proposal: &HitProposal,
        now: f64,
    ) -> Option<HitOutcome> {
        if self.status != RoomStatus::Active || !self.is_connected(sender) {
            return None;
        }
        match self.combat.propose_hit(&mut self.players, proposal, now) {
            Ok(outcome) => {
                self.apply_hit(&outcome, now);
                Some(outcome)
            }
            Err(reason) => {
                debug!(
                    "[Room {}] Hit {} -> {} rejected: {}",
                    self.match_id, proposal.attacker, proposal.target, reason
                );
                None
            }
        }
    }

    fn apply_hit(&mut self, outcome: &HitOutcome, now: f64) {
        self.ledger.record_hit(outcome.attacker);
        if outcome.applied > 0 {
            self.ledger.record_damage(outcome.attacker, outcome.applied);
        }

        if let (Some(charge), Some(attacker)) = (outcome.charge, self.players.get(&outcome.attacker)) {
            let packet = Packet::SuperUpdate {
                username: attacker.name.clone(),
                charge,
                max_charge: attacker.max_super_charge(),
            };
            self.push(Audience::Room, packet);
        }

        if outcome.credits_kill() {
            self.ledger.record_kill(outcome.attacker);
        }

        self.broadcast_health(outcome.target, now);

        if outcome.killed {
            let victim = self.player_name(outcome.target);
            info!(
                "[Room {}] Player {} was killed by {}",
                self.match_id,
                victim,
                self.player_name(outcome.attacker)
            );
            self.push(
                Audience::Room,
                Packet::PlayerDead {
                    username: victim,
                    match_id: self.match_id,
                },
            );
            self.check_victory(now);
        }
    }

    pub fn handle_heal(
        &mut self,
        sender: UserId,
        proposal: &HealProposal,
        now: f64,
    ) -> Option<HealOutcome> {
        if self.status != RoomStatus::Active || !self.is_connected(sender) {
            return None;
        }
        match self.combat.propose_heal(&mut self.players, sender, proposal, now) {
            Ok(outcome) => {
                self.broadcast_health(outcome.target, now);
                Some(outcome)
            }
            Err(reason) => {
                debug!(
                    "[Room {}] Heal on {} rejected: {}",
                    self.match_id, proposal.target, reason
                );
                None
            }
        }
    }

    /// Records a readiness acknowledgement. Duplicates are ignored; the last
    /// missing ack finalizes the start.
    pub fn ready_ack(&mut self, user_id: UserId, now: f64) -> bool {
        if self.status != RoomStatus::Starting {
            return false;
        }
        if !self.players.contains_key(&user_id) || !self.required.contains(&user_id) {
            return false;
        }
        if !self.acks.insert(user_id) {
            return false;
        }
        info!(
            "[Room {}] Ready ack from {} ({}/{})",
            self.match_id,
            self.player_name(user_id),
            self.acks.len(),
            self.required.len()
        );

        if self.required.iter().all(|id| self.acks.contains(id)) {
            self.finalize_start(StartReason::AllAcks, now);
        }
        true
    }

    fn begin_starting(&mut self, now: f64) {
        if self.status != RoomStatus::Waiting {
            return;
        }
        self.status = RoomStatus::Starting;
        self.acks.clear();
        self.start_deadline = Some(now + self.config.start_timeout_ms);
        info!(
            "[Room {}] Entering starting phase ({} ms timeout)",
            self.match_id, self.config.start_timeout_ms
        );

        self.push(
            Audience::Room,
            Packet::Starting {
                timeout_ms: self.config.start_timeout_ms as u64,
                at: wall_clock_ms(),
            },
        );
    }

    /// Leaves the starting phase. Only the first call has any effect.
    pub fn finalize_start(&mut self, reason: StartReason, now: f64) -> bool {
        if self.status != RoomStatus::Starting {
            return false;
        }
        self.start_deadline = None;
        info!(
            "[Room {}] Finalizing start (reason={}) acks={}/{}",
            self.match_id,
            reason,
            self.acks.len(),
            self.required.len()
        );

        let countdown = match reason {
            StartReason::AllAcks => self.config.start_countdown_secs,
            StartReason::Timeout => 0,
        };
        self.start_game(countdown, now);
        true
    }

    fn start_game(&mut self, countdown_secs: u32, now: f64) {
        info!(
            "[Room {}] Starting game with {} players",
            self.match_id,
            self.players.len()
        );
        self.status = RoomStatus::Active;
        self.loop_start_at = Some(now + countdown_secs as f64 * 1000.0);
        self.push(
            Audience::Room,
            Packet::Start {
                countdown: countdown_secs,
            },
        );
    }

    /// Fires whatever is due at `now`: the start timeout, the delayed loop
    /// start and any accumulated simulation ticks.
    pub fn poll(&mut self, now: f64) {
        if self.status == RoomStatus::Starting && self.start_deadline.is_some_and(|d| now >= d) {
            self.finalize_start(StartReason::Timeout, now);
        }

        if self.status == RoomStatus::Active && self.stepper.is_none() {
            if let Some(at) = self.loop_start_at {
                if now >= at {
                    self.loop_start_at = None;
                    self.stepper = Some(FixedStep::new(
                        self.config.fixed_step_ms,
                        self.config.max_frame_ms,
                        now,
                    ));
                    info!("[Room {}] Fixed-step loop started", self.match_id);
                }
            }
        }

        let steps = match self.stepper.as_mut() {
            Some(stepper) => stepper.advance(now),
            None => 0,
        };
        for _ in 0..steps {
            if self.stepper.is_none() {
                break;
            }
            self.step(now);
        }
    }

    /// Milliseconds until `poll` next has work, or `None` when the room only
    /// reacts to commands.
    pub fn next_wake_in(&self, now: f64) -> Option<f64> {
        let start_deadline = self
            .start_deadline
            .filter(|_| self.status == RoomStatus::Starting)
            .map(|d| (d - now).max(0.0));
        let loop_start = self.loop_start_at.map(|at| (at - now).max(0.0));
        let tick = self.stepper.as_ref().map(FixedStep::next_wake_in);
        let teardown = self.teardown_at.map(|at| (at - now).max(0.0));

        [start_deadline, loop_start, tick, teardown]
            .into_iter()
            .flatten()
            .reduce(f64::min)
    }

    fn step(&mut self, now: f64) {
        self.tick_id += 1;

        for player in self.players.values_mut() {
            player.integrate_input();
        }

        let healed = process_regen(self.players.values_mut(), now, &self.config.regen);
        for user_id in healed {
            self.broadcast_health(user_id, now);
        }

        if self.tick_id % self.config.snapshot_every_ticks == 0 {
            self.emit_snapshot(now);
        }
    }

    fn emit_snapshot(&mut self, now: f64) {
        if let Some(last) = self.last_snapshot_at {
            let spacing = now - last;
            if spacing >= 0.0 {
                if self.spacing.len() == SPACING_SAMPLES {
                    self.spacing.pop_front();
                }
                self.spacing.push_back(spacing);
            }
        }
        self.last_snapshot_at = Some(now);

        let players = self
            .players
            .values()
            .map(|p| (p.name.clone(), p.frame()))
            .collect();
        let snapshot = Snapshot {
            tick_id: self.tick_id,
            t_mono: now,
            sent_at_wall_ms: wall_clock_ms(),
            players,
        };
        self.push(Audience::Room, Packet::Snapshot(snapshot));

        if now - self.last_diag_at >= self.config.diagnostics_interval_ms {
            if let Some((avg, stdev)) = self.snapshot_spacing() {
                debug!(
                    "[Room {}] timing tickId={} avgSpacing={:.2}ms stdev={:.2}ms samples={}",
                    self.match_id,
                    self.tick_id,
                    avg,
                    stdev,
                    self.spacing.len()
                );
                self.last_diag_at = now;
            }
        }
    }

    /// Average and standard deviation of recent snapshot spacing.
    pub fn snapshot_spacing(&mut self) -> Option<(f64, f64)> {
        mean_and_stdev(self.spacing.make_contiguous())
    }

    fn check_victory(&mut self, now: f64) {
        if self.status != RoomStatus::Active {
            return;
        }
        let winner = match self.alive_counts() {
            (0, 0) => None,
            (0, _) => Some(Team::Team2),
            (_, 0) => Some(Team::Team1),
            _ => return,
        };
        self.finish(winner, now);
    }

    /// Ends the match: stops the loop, settles rewards and broadcasts the
    /// result. Persistence is left to the caller via [`take_settlement`].
    ///
    /// [`take_settlement`]: SessionRoom::take_settlement
    pub fn finish(&mut self, winner: Option<Team>, now: f64) -> bool {
        if self.status == RoomStatus::Finished {
            return false;
        }
        self.status = RoomStatus::Finished;
        self.stepper = None;
        self.loop_start_at = None;
        self.start_deadline = None;

        let (team1_alive, team2_alive) = self.alive_counts();
        match winner {
            Some(team) => info!("[Room {}] Game finished. Winner: {}", self.match_id, team),
            None => info!("[Room {}] Game finished. Winner: draw", self.match_id),
        }

        let overrides = self.runtime.get();
        let (rewards, credits) = self.ledger.settle(winner, &overrides);
        self.push(
            Audience::Room,
            Packet::GameOver {
                match_id: self.match_id,
                winner_team: winner,
                meta: GameOverMeta {
                    team1_alive,
                    team2_alive,
                    rewards,
                },
            },
        );

        self.settlement = Some(Settlement {
            match_id: self.match_id,
            winner,
            credits,
        });
        self.teardown_at = Some(now + self.config.grace_ms);
        true
    }

    pub fn take_settlement(&mut self) -> Option<Settlement> {
        self.settlement.take()
    }

    pub fn init_state(&self, user_id: UserId) -> Option<InitState> {
        let me = self.players.get(&user_id)?;
        let mut players: Vec<RosterEntry> = self
            .players
            .values()
            .map(|p| RosterEntry {
                name: p.name.clone(),
                team: p.team,
                character: p.character.clone(),
                x: p.x,
                y: p.y,
                health: p.health(),
                max_health: p.max_health(),
                super_charge: p.super_charge(),
                max_super_charge: p.max_super_charge(),
                level: p.level,
                is_alive: p.is_alive(),
                spawn_index: self.spawn_index(&p.name, p.team),
            })
            .collect();
        players.sort_by(|a, b| a.name.cmp(&b.name));

        Some(InitState {
            match_id: self.match_id,
            mode: self.data.mode.clone(),
            map: self.data.map.clone(),
            your_team: me.team,
            your_character: me.character.clone(),
            spawn_version: self.spawn_version,
            status: self.status,
            players,
        })
    }

    /// Position of `name` in the alphabetically sorted roster of its team.
    pub fn spawn_index(&self, name: &str, team: Team) -> usize {
        let mut names: Vec<&str> = self
            .data
            .players
            .iter()
            .filter(|p| p.team == team)
            .map(|p| p.name.as_str())
            .collect();
        names.sort_unstable();
        names.iter().position(|n| *n == name).unwrap_or(0)
    }

    /// Resolves an audience to the connected user ids it covers.
    pub fn recipients(&self, audience: Audience) -> Vec<UserId> {
        match audience {
            Audience::Only(user_id) => vec![user_id],
            Audience::Room => self
                .players
                .values()
                .filter(|p| p.connected)
                .map(|p| p.user_id)
                .collect(),
            Audience::Others(excluded) => self
                .players
                .values()
                .filter(|p| p.connected && p.user_id != excluded)
                .map(|p| p.user_id)
                .collect(),
        }
    }

    pub fn drain_outbox(&mut self) -> Vec<Envelope> {
        std::mem::take(&mut self.outbox)
    }

    fn broadcast_health(&mut self, user_id: UserId, now: f64) {
        let Some(player) = self.players.get_mut(&user_id) else {
            return;
        };
        player.last_health_broadcast_at = Some(now);
        let packet = Packet::HealthUpdate {
            username: player.name.clone(),
            health: player.health(),
            max_health: player.max_health().max(1),
            match_id: self.match_id,
        };
        self.push(Audience::Room, packet);
    }

    fn is_connected(&self, user_id: UserId) -> bool {
        self.players.get(&user_id).is_some_and(|p| p.connected)
    }

    fn player_name(&self, user_id: UserId) -> String {
        self.players
            .get(&user_id)
            .map(|p| p.name.clone())
            .unwrap_or_default()
    }

    fn push(&mut self, audience: Audience, packet: Packet) {
        self.outbox.push(Envelope { audience, packet });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::tests::participant;
    use shared::AttackType;

    fn match_data(players: &[(UserId, &str, Team)]) -> MatchData {
        MatchData {
            mode: "duel".to_string(),
            map: "lushy".to_string(),
            players: players
                .iter()
                .map(|(id, name, team)| participant(*id, name, *team))
                .collect(),
        }
    }

    fn duel() -> SessionRoom {
        SessionRoom::new(
            7,
            match_data(&[(1, "alice", Team::Team1), (2, "bob", Team::Team2)]),
            RoomConfig::default(),
            RuntimeConfig::default(),
            0.0,
        )
    }

    /// Both players joined and acked at t=100; the loop runs from t=3100.
    fn active_duel() -> SessionRoom {
        let mut room = duel();
        room.join(1, 1, 0.0).unwrap();
        room.join(2, 1, 0.0).unwrap();
        room.ready_ack(1, 100.0);
        room.ready_ack(2, 100.0);
        room.poll(3100.0);
        room.drain_outbox();
        room
    }

    fn packets(room: &mut SessionRoom) -> Vec<Packet> {
        room.drain_outbox().into_iter().map(|e| e.packet).collect()
    }

    fn hit(attacker: &str, target: &str) -> HitProposal {
        HitProposal {
            attacker: attacker.to_string(),
            target: target.to_string(),
            attack_type: AttackType::Basic,
            instance_id: None,
        }
    }

    #[test]
    fn test_non_participant_cannot_join() {
        let mut room = duel();
        let err = room.join(99, 1, 0.0).unwrap_err();
        assert!(matches!(err, JoinError::NotParticipant(99)));
        assert_eq!(err.code(), JoinFailure::JoinFailed);
        assert!(room.player(99).is_none());
        assert!(room.drain_outbox().is_empty());
    }

    #[test]
    fn test_join_sends_ack_and_init_then_starts() {
        let mut room = duel();
        assert_eq!(room.join(1, 1, 0.0).unwrap(), JoinOutcome::Joined);
        let first = room.drain_outbox();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].audience, Audience::Only(1));
        assert!(matches!(first[0].packet, Packet::Joined { ok: true, match_id: 7 }));
        assert!(matches!(&first[1].packet, Packet::Init(init) if init.players.len() == 1));
        assert_eq!(room.status(), RoomStatus::Waiting);

        room.join(2, 1, 0.0).unwrap();
        assert_eq!(room.status(), RoomStatus::Starting);
        let sent = packets(&mut room);
        assert!(sent
            .iter()
            .any(|p| matches!(p, Packet::Starting { timeout_ms: 10_000, .. })));
    }

    #[test]
    fn test_reconnect_keeps_state_and_resends_init() {
        let mut room = active_duel();
        room.handle_hit(1, &hit("alice", "bob"), 4000.0).unwrap();
        assert!(room.leave(2));
        assert!(!room.leave(2));
        assert_eq!(room.connected_count(), 1);
        room.drain_outbox();

        assert_eq!(room.join(2, 1, 5000.0).unwrap(), JoinOutcome::Reconnected);
        assert_eq!(room.player(2).unwrap().health(), 5500);
        assert_eq!(room.connected_count(), 2);
        assert!(packets(&mut room).iter().any(|p| matches!(p, Packet::Init(_))));
    }

    #[test]
    fn test_all_acks_start_after_countdown() {
        let mut room = duel();
        room.join(1, 1, 0.0).unwrap();
        room.join(2, 1, 0.0).unwrap();
        room.drain_outbox();

        assert!(room.ready_ack(1, 100.0));
        assert_eq!(room.status(), RoomStatus::Starting);
        assert!(room.ready_ack(2, 100.0));
        assert_eq!(room.status(), RoomStatus::Active);
        assert!(packets(&mut room)
            .iter()
            .any(|p| matches!(p, Packet::Start { countdown: 3 })));

        // Loop does not run during the countdown.
        room.poll(3099.0);
        assert_eq!(room.tick_id(), 0);
        room.poll(3100.0);
        room.poll(3200.0);
        assert!(room.tick_id() > 0);
    }

    #[test]
    fn test_duplicate_acks_are_ignored() {
        let mut room = duel();
        room.join(1, 1, 0.0).unwrap();
        room.join(2, 1, 0.0).unwrap();

        assert!(room.ready_ack(1, 10.0));
        assert!(!room.ready_ack(1, 20.0));
        assert!(!room.ready_ack(99, 20.0));
        assert_eq!(room.status(), RoomStatus::Starting);
    }

    #[test]
    fn test_timeout_activates_exactly_once() {
        let mut room = duel();
        room.join(1, 1, 0.0).unwrap();
        room.join(2, 1, 0.0).unwrap();
        room.ready_ack(1, 100.0);

        room.poll(9_999.0);
        assert_eq!(room.status(), RoomStatus::Starting);

        room.poll(10_000.0);
        assert_eq!(room.status(), RoomStatus::Active);

        // Late ack and a second finalize are both no-ops.
        assert!(!room.ready_ack(2, 10_010.0));
        assert!(!room.finalize_start(StartReason::Timeout, 10_020.0));
        assert!(!room.finalize_start(StartReason::AllAcks, 10_020.0));

        let starts: Vec<_> = packets(&mut room)
            .into_iter()
            .filter(|p| matches!(p, Packet::Start { .. }))
            .collect();
        assert_eq!(starts.len(), 1);
        assert!(matches!(starts[0], Packet::Start { countdown: 0 }));
    }

    #[test]
    fn test_snapshot_ticks_strictly_increase() {
        let mut room = active_duel();
        for i in 1..=200 {
            room.poll(3100.0 + i as f64 * 5.0);
        }

        let snapshots: Vec<Snapshot> = packets(&mut room)
            .into_iter()
            .filter_map(|p| match p {
                Packet::Snapshot(s) => Some(s),
                _ => None,
            })
            .collect();

        assert!(snapshots.len() >= 19 && snapshots.len() <= 20);
        for pair in snapshots.windows(2) {
            assert!(pair[1].tick_id > pair[0].tick_id);
            assert!(pair[1].t_mono >= pair[0].t_mono);
        }
        assert!(snapshots.iter().all(|s| s.tick_id % 3 == 0));
        assert_eq!(snapshots[0].players.len(), 2);
        assert!(room.snapshot_spacing().is_some());
    }

    #[test]
    fn test_input_applies_at_tick_boundary() {
        let mut room = active_duel();
        let input = InputFrame {
            x: 500.0,
            y: 300.0,
            flip: Some(true),
            animation: Some("run".to_string()),
        };
        assert!(room.submit_input(1, input, 3105.0));
        assert_eq!(room.player(1).unwrap().x, 400.0);

        room.poll(3118.0);
        let alice = room.player(1).unwrap();
        assert_eq!((alice.x, alice.y), (500.0, 300.0));
        assert!(alice.flip);

        let bad = InputFrame {
            x: f32::NAN,
            y: 0.0,
            flip: None,
            animation: None,
        };
        assert!(!room.submit_input(1, bad, 3120.0));
    }

    #[test]
    fn test_valid_hit_broadcasts_health() {
        let mut room = active_duel();
        room.handle_hit(1, &hit("alice", "bob"), 4000.0).unwrap();

        let sent = packets(&mut room);
        assert!(sent.iter().any(|p| matches!(
            p,
            Packet::HealthUpdate { username, health: 5500, max_health: 7000, .. } if username == "bob"
        )));
        assert!(sent.iter().any(|p| matches!(
            p,
            Packet::SuperUpdate { username, charge: 1500, max_charge: 4500 } if username == "alice"
        )));
        assert_eq!(room.ledger().get(1).unwrap().hits, 1);
        assert_eq!(room.ledger().get(1).unwrap().damage, 1500);

        // Replay inside the dedup window changes nothing.
        assert!(room.handle_hit(1, &hit("alice", "bob"), 4050.0).is_none());
        assert_eq!(room.player(2).unwrap().health(), 5500);
        assert!(packets(&mut room).is_empty());
    }

    #[test]
    fn test_hits_ignored_before_active() {
        let mut room = duel();
        room.join(1, 1, 0.0).unwrap();
        room.join(2, 1, 0.0).unwrap();
        assert!(room.handle_hit(1, &hit("alice", "bob"), 100.0).is_none());
        assert_eq!(room.player(2).unwrap().health(), 7000);
    }

    #[test]
    fn test_elimination_finishes_match() {
        let mut room = active_duel();
        for i in 0..5 {
            room.handle_hit(1, &hit("alice", "bob"), 4000.0 + i as f64 * 100.0);
        }

        assert_eq!(room.status(), RoomStatus::Finished);
        assert!(!room.player(2).unwrap().is_alive());
        assert_eq!(room.ledger().get(1).unwrap().kills, 1);

        let sent = packets(&mut room);
        assert!(sent
            .iter()
            .any(|p| matches!(p, Packet::PlayerDead { username, .. } if username == "bob")));
        let game_over = sent
            .iter()
            .find_map(|p| match p {
                Packet::GameOver {
                    winner_team, meta, ..
                } => Some((*winner_team, meta.clone())),
                _ => None,
            })
            .unwrap();
        assert_eq!(game_over.0, Some(Team::Team1));
        assert_eq!((game_over.1.team1_alive, game_over.1.team2_alive), (1, 0));
        // 40 + 5*2 + floor(7000/150) + 25 + 40
        let alice = game_over.1.rewards.iter().find(|r| r.username == "alice").unwrap();
        assert_eq!(alice.coins_awarded, 161);

        let settlement = room.take_settlement().unwrap();
        assert_eq!(settlement.winner, Some(Team::Team1));
        assert_eq!(settlement.credits.len(), 2);
        assert!(room.take_settlement().is_none());

        // The loop is stopped and only the teardown timer remains.
        let wake = room.next_wake_in(4400.0).unwrap();
        assert!((wake - 15_000.0).abs() < 1e-6);
        assert!(!room.is_torn_down(19_399.0));
        assert!(room.is_torn_down(19_400.0));
        assert!(matches!(room.join(1, 1, 19_500.0), Err(JoinError::Closed(7))));
    }

    #[test]
    fn test_draw_and_finish_idempotence() {
        let mut room = active_duel();
        assert!(room.finish(None, 5000.0));
        assert!(!room.finish(Some(Team::Team1), 5001.0));

        let sent = packets(&mut room);
        let overs: Vec<_> = sent
            .iter()
            .filter(|p| matches!(p, Packet::GameOver { .. }))
            .collect();
        assert_eq!(overs.len(), 1);
        match overs[0] {
            Packet::GameOver {
                winner_team, meta, ..
            } => {
                assert_eq!(*winner_team, None);
                // Draw bonus only.
                assert!(meta.rewards.iter().all(|r| r.coins_awarded == 65));
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_last_two_deaths_draw() {
        let mut room = active_duel();
        room.player_mut(1).unwrap().apply_damage(7000);
        room.player_mut(2).unwrap().apply_damage(6000);
        room.drain_outbox();
        assert_eq!(room.alive_counts(), (0, 1));
        assert_eq!(room.status(), RoomStatus::Active);

        // Falling out of the world finishes bob off.
        let outcome = room.handle_hit(2, &hit("bob", "bob"), 4000.0).unwrap();
        assert!(outcome.killed);
        assert_eq!(room.status(), RoomStatus::Finished);

        let sent = packets(&mut room);
        let overs: Vec<_> = sent
            .iter()
            .filter_map(|p| match p {
                Packet::GameOver {
                    winner_team, meta, ..
                } => Some((*winner_team, meta.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(overs.len(), 1);
        let (winner, meta) = &overs[0];
        assert_eq!(*winner, None);
        assert_eq!((meta.team1_alive, meta.team2_alive), (0, 0));
        // Base plus draw bonus, no win gems.
        let alice = meta.rewards.iter().find(|r| r.username == "alice").unwrap();
        assert_eq!((alice.coins_awarded, alice.gems_awarded), (65, 0));

        assert_eq!(room.take_settlement().unwrap().winner, None);
    }

    #[test]
    fn test_regen_runs_inside_ticks() {
        let mut room = active_duel();
        room.handle_hit(1, &hit("alice", "bob"), 4000.0).unwrap();
        room.drain_outbox();

        room.poll(7000.0);
        assert_eq!(room.player(2).unwrap().health(), 5500);

        room.poll(7600.0);
        assert_eq!(room.player(2).unwrap().health(), 6000);
        assert!(packets(&mut room).iter().any(|p| matches!(
            p,
            Packet::HealthUpdate { username, health: 6000, .. } if username == "bob"
        )));
    }

    #[test]
    fn test_special_needs_full_charge() {
        let mut room = active_duel();
        assert!(!room.activate_special(1));

        for i in 0..3 {
            room.handle_hit(1, &hit("alice", "bob"), 4000.0 + i as f64 * 100.0);
        }
        assert_eq!(room.player(1).unwrap().super_charge(), 4500);
        room.drain_outbox();

        assert!(room.activate_special(1));
        assert_eq!(room.player(1).unwrap().super_charge(), 0);
        let sent = packets(&mut room);
        assert!(sent
            .iter()
            .any(|p| matches!(p, Packet::SuperUpdate { charge: 0, .. })));
        assert!(sent
            .iter()
            .any(|p| matches!(p, Packet::PlayerSpecial { username, .. } if username == "alice")));
    }

    #[test]
    fn test_leave_during_active_notifies_room() {
        let mut room = active_duel();
        assert!(room.leave(1));
        assert!(packets(&mut room).iter().any(|p| matches!(
            p,
            Packet::PlayerDisconnected { name, players_remaining: 1 } if name == "alice"
        )));
        assert_eq!(room.recipients(Audience::Room), vec![2]);
        assert!(room.leave(2));
        assert!(room.is_empty());
    }

    #[test]
    fn test_action_relay_marks_combat() {
        let mut room = active_duel();
        assert!(room.relay_action(1, "basic", vec![1, 2, 3], 4200.0));
        assert_eq!(room.player(1).unwrap().last_combat_at, 4200.0);
        assert!(packets(&mut room).iter().any(|p| matches!(
            p,
            Packet::PlayerAction { kind, data, .. } if kind == "basic" && data.as_slice() == [1u8, 2, 3]
        )));
        assert!(!room.relay_action(1, "  ", Vec::new(), 4300.0));
    }

    #[test]
    fn test_spawn_index_sorted_per_team() {
        let room = SessionRoom::new(
            8,
            match_data(&[
                (1, "zed", Team::Team1),
                (2, "amy", Team::Team1),
                (3, "kim", Team::Team2),
                (4, "bo", Team::Team2),
            ]),
            RoomConfig::default(),
            RuntimeConfig::default(),
            0.0,
        );
        assert_eq!(room.spawn_index("amy", Team::Team1), 0);
        assert_eq!(room.spawn_index("zed", Team::Team1), 1);
        assert_eq!(room.spawn_index("bo", Team::Team2), 0);
        assert_eq!(room.spawn_index("kim", Team::Team2), 1);
    }

    #[test]
    fn test_recipients() {
        let mut room = duel();
        room.join(1, 1, 0.0).unwrap();
        room.join(2, 1, 0.0).unwrap();
        let mut everyone = room.recipients(Audience::Room);
        everyone.sort_unstable();
        assert_eq!(everyone, vec![1, 2]);
        assert_eq!(room.recipients(Audience::Others(1)), vec![2]);
        assert_eq!(room.recipients(Audience::Only(1)), vec![1]);
    }
}
