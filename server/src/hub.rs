//! Registry of live rooms and the async task that drives each one.
//!
//! Every room runs in its own tokio task that owns the `SessionRoom`
//! outright; the hub only holds a command sender per room. Rooms therefore
//! share no mutable state and never lock each other. Outgoing packets from
//! all rooms funnel into one `Outbound` channel consumed by the network layer.

use crate::config::{RoomConfig, RuntimeConfig};
use crate::room::{JoinError, JoinOutcome, RoomSummary, SessionRoom, Settlement};
use crate::store::{MatchData, MatchStore};
use log::{debug, error, info, warn};
use shared::{HealProposal, HitProposal, InputFrame, MatchId, Packet, SessionClock, UserId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Packets a room wants delivered, already resolved to user ids.
#[derive(Debug)]
pub struct Outbound {
    pub recipients: Vec<UserId>,
    pub packet: Packet,
}

/// Requests routed into a room task.
#[derive(Debug)]
pub enum RoomCommand {
    Join {
        user_id: UserId,
        level: u32,
        reply: oneshot::Sender<Result<JoinOutcome, JoinError>>,
    },
    Leave {
        user_id: UserId,
        reply: Option<oneshot::Sender<usize>>,
    },
    Input {
        user_id: UserId,
        input: InputFrame,
    },
    Action {
        user_id: UserId,
        kind: String,
        data: Vec<u8>,
    },
    Special {
        user_id: UserId,
    },
    Hit {
        user_id: UserId,
        proposal: HitProposal,
    },
    Heal {
        user_id: UserId,
        proposal: HealProposal,
    },
    Ready {
        user_id: UserId,
    },
    Summary {
        reply: oneshot::Sender<RoomSummary>,
    },
    Shutdown,
}

pub struct RoomHandle {
    pub match_id: MatchId,
    data: MatchData,
    commands: mpsc::UnboundedSender<RoomCommand>,
    task: JoinHandle<()>,
}

impl RoomHandle {
    pub fn send(&self, command: RoomCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    pub fn data(&self) -> &MatchData {
        &self.data
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HubStats {
    pub active_rooms: usize,
    pub rooms: Vec<RoomSummary>,
}

/// Owns every live room, keyed by match id.
pub struct SessionHub {
    rooms: HashMap<MatchId, RoomHandle>,
    store: Arc<dyn MatchStore>,
    runtime: RuntimeConfig,
    room_config: RoomConfig,
    clock: SessionClock,
    outbound: mpsc::UnboundedSender<Outbound>,
    closed_tx: mpsc::UnboundedSender<MatchId>,
}

impl SessionHub {
    /// Creates the hub. The returned receiver yields the id of every room
    /// whose task has ended on its own (grace period over); the owner should
    /// call [`SessionHub::remove_room`] for each.
    pub fn new(
        store: Arc<dyn MatchStore>,
        runtime: RuntimeConfig,
        room_config: RoomConfig,
        outbound: mpsc::UnboundedSender<Outbound>,
    ) -> (Self, mpsc::UnboundedReceiver<MatchId>) {
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        let hub = Self {
            rooms: HashMap::new(),
            store,
            runtime,
            room_config,
            clock: SessionClock::start(),
            outbound,
            closed_tx,
        };
        (hub, closed_rx)
    }

    pub fn runtime(&self) -> &RuntimeConfig {
        &self.runtime
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn get(&self, match_id: MatchId) -> Option<&RoomHandle> {
        self.rooms.get(&match_id)
    }

    /// Spawns a room for `match_id` unless one already exists.
    pub fn create_room(&mut self, match_id: MatchId, data: MatchData) -> &RoomHandle {
        if self.rooms.contains_key(&match_id) {
            warn!("[Hub] Room {} already exists", match_id);
        }
        let store = Arc::clone(&self.store);
        let runtime = self.runtime.clone();
        let room_config = self.room_config.clone();
        let clock = self.clock;
        let outbound = self.outbound.clone();
        let closed_tx = self.closed_tx.clone();

        self.rooms.entry(match_id).or_insert_with(|| {
            let (commands, command_rx) = mpsc::unbounded_channel();
            let room = SessionRoom::new(
                match_id,
                data.clone(),
                room_config,
                runtime,
                clock.now_ms(),
            );
            info!(
                "[Hub] Created game room {} for {} players",
                match_id,
                data.players.len()
            );
            let task = tokio::spawn(run_room(
                room, clock, command_rx, outbound, store, closed_tx,
            ));
            RoomHandle {
                match_id,
                data,
                commands,
                task,
            }
        })
    }

    /// Drops a room and stops its task. Idempotent.
    pub fn remove_room(&mut self, match_id: MatchId) -> bool {
        match self.rooms.remove(&match_id) {
            Some(handle) => {
                handle.send(RoomCommand::Shutdown);
                info!("[Hub] Removed game room {}", match_id);
                true
            }
            None => false,
        }
    }

    /// Joins `user_id` to a match, creating the room first when the match
    /// is live in the store but has no room yet.
    pub async fn handle_join(
        &mut self,
        user_id: UserId,
        match_id: MatchId,
    ) -> Result<JoinOutcome, JoinError> {
        if match_id == 0 {
            return Err(JoinError::InvalidMatchId);
        }

        if !self.rooms.contains_key(&match_id) {
            match self.store.load_match(match_id).await {
                Ok(Some(data)) => {
                    self.create_room(match_id, data);
                }
                Ok(None) => return Err(JoinError::NotFound(match_id)),
                Err(e) => {
                    warn!("[Hub] Failed to load match {}: {}", match_id, e);
                    return Err(JoinError::Store(e));
                }
            }
        }

        let handle = self
            .rooms
            .get(&match_id)
            .ok_or(JoinError::NotFound(match_id))?;
        let participant = handle
            .data
            .participant(user_id)
            .ok_or(JoinError::NotParticipant(user_id))?;

        let level = match self
            .store
            .character_level(user_id, &participant.character)
            .await
        {
            Ok(level) => level,
            Err(e) => {
                warn!("[Hub] Level lookup for user {} failed: {}", user_id, e);
                1
            }
        };

        let (reply, response) = oneshot::channel();
        if !handle.send(RoomCommand::Join {
            user_id,
            level,
            reply,
        }) {
            return Err(JoinError::Closed(match_id));
        }
        response.await.map_err(|_| JoinError::Closed(match_id))?
    }

    /// Detaches `user_id` from a room and removes the room once nobody is
    /// left connected.
    pub async fn handle_leave(&mut self, user_id: UserId, match_id: MatchId) {
        let Some(handle) = self.rooms.get(&match_id) else {
            return;
        };
        let (reply, response) = oneshot::channel();
        if !handle.send(RoomCommand::Leave {
            user_id,
            reply: Some(reply),
        }) {
            return;
        }
        match response.await {
            Ok(0) => {
                self.remove_room(match_id);
            }
            Ok(remaining) => debug!("[Hub] Room {} has {} connected", match_id, remaining),
            Err(_) => debug!("[Hub] Room {} went away during leave", match_id),
        }
    }

    /// Routes a command to a room. Returns false if the room is gone.
    pub fn route(&self, match_id: MatchId, command: RoomCommand) -> bool {
        match self.rooms.get(&match_id) {
            Some(handle) => handle.send(command),
            None => false,
        }
    }

    pub async fn stats(&self) -> HubStats {
        let mut rooms = Vec::with_capacity(self.rooms.len());
        for handle in self.rooms.values() {
            let (reply, response) = oneshot::channel();
            if handle.send(RoomCommand::Summary { reply }) {
                if let Ok(summary) = response.await {
                    rooms.push(summary);
                }
            }
        }
        rooms.sort_by_key(|r| r.match_id);
        HubStats {
            active_rooms: rooms.len(),
            rooms,
        }
    }
}

/// Drives one room until its grace period ends or the hub shuts it down.
async fn run_room(
    mut room: SessionRoom,
    clock: SessionClock,
    mut commands: mpsc::UnboundedReceiver<RoomCommand>,
    outbound: mpsc::UnboundedSender<Outbound>,
    store: Arc<dyn MatchStore>,
    closed_tx: mpsc::UnboundedSender<MatchId>,
) {
    let match_id = room.match_id();
    let mut torn_down = false;

    loop {
        let now = clock.now_ms();
        room.poll(now);
        flush(&mut room, &outbound, &store);

        if room.is_torn_down(now) {
            torn_down = true;
            break;
        }

        let wake = room.next_wake_in(now);
        tokio::select! {
            command = commands.recv() => {
                match command {
                    Some(RoomCommand::Shutdown) | None => break,
                    Some(command) => apply(&mut room, command, clock.now_ms()),
                }
            }
            _ = sleep_for(wake) => {}
        }
    }

    info!("[Room {}] Cleaned up", match_id);
    if torn_down {
        let _ = closed_tx.send(match_id);
    }
}

fn apply(room: &mut SessionRoom, command: RoomCommand, now: f64) {
    match command {
        RoomCommand::Join {
            user_id,
            level,
            reply,
        } => {
            let result = room.join(user_id, level, now);
            if let Err(e) = &result {
                warn!("[Room {}] Join by {} failed: {}", room.match_id(), user_id, e);
            }
            let _ = reply.send(result);
        }
        RoomCommand::Leave { user_id, reply } => {
            room.leave(user_id);
            if let Some(reply) = reply {
                let _ = reply.send(room.connected_count());
            }
        }
        RoomCommand::Input { user_id, input } => {
            room.submit_input(user_id, input, now);
        }
        RoomCommand::Action {
            user_id,
            kind,
            data,
        } => {
            room.relay_action(user_id, &kind, data, now);
        }
        RoomCommand::Special { user_id } => {
            room.activate_special(user_id);
        }
        RoomCommand::Hit { user_id, proposal } => {
            room.handle_hit(user_id, &proposal, now);
        }
        RoomCommand::Heal { user_id, proposal } => {
            room.handle_heal(user_id, &proposal, now);
        }
        RoomCommand::Ready { user_id } => {
            room.ready_ack(user_id, now);
        }
        RoomCommand::Summary { reply } => {
            let _ = reply.send(room.summary(now));
        }
        RoomCommand::Shutdown => {}
    }
}

/// Hands queued packets to the network layer and starts persistence for a
/// finished match. Never waits on either.
fn flush(
    room: &mut SessionRoom,
    outbound: &mpsc::UnboundedSender<Outbound>,
    store: &Arc<dyn MatchStore>,
) {
    for envelope in room.drain_outbox() {
        let recipients = room.recipients(envelope.audience);
        if recipients.is_empty() {
            continue;
        }
        if outbound
            .send(Outbound {
                recipients,
                packet: envelope.packet,
            })
            .is_err()
        {
            error!("[Room {}] Outbound channel closed", room.match_id());
        }
    }

    if let Some(settlement) = room.take_settlement() {
        tokio::spawn(persist_settlement(Arc::clone(store), settlement));
    }
}

/// Best-effort: failures are logged and never reach clients.
pub async fn persist_settlement(store: Arc<dyn MatchStore>, settlement: Settlement) {
    let match_id = settlement.match_id;
    if let Err(e) = store.complete_match(match_id).await {
        warn!("[Room {}] Failed to update match status: {}", match_id, e);
    }
    for credit in settlement.credits {
        if let Err(e) = store
            .credit_currency(credit.user_id, credit.coins, credit.gems)
            .await
        {
            warn!(
                "[Room {}] Failed to update rewards for user {}: {}",
                match_id, credit.user_id, e
            );
        }
    }
}

async fn sleep_for(delay_ms: Option<f64>) {
    match delay_ms {
        Some(ms) => tokio::time::sleep(Duration::from_secs_f64(ms.max(0.0) / 1000.0)).await,
        None => std::future::pending::<()>().await,
    }
}
