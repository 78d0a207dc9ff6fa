use crate::receiver::{ReceiverConfig, RenderFrame, SnapshotReceiver};
use bincode::{deserialize, serialize};
use log::{debug, error, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shared::{
    clamp_to_world, AttackType, HitProposal, InitState, InputFrame, MatchId, Packet,
    SessionClock, Team, UserId,
};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{interval, MissedTickBehavior};

const FRAME_INTERVAL: Duration = Duration::from_millis(16);
/// Frames between movement updates (roughly the snapshot rate).
const INPUT_EVERY_FRAMES: u64 = 3;
/// Frames between scripted attacks.
const ATTACK_EVERY_FRAMES: u64 = 45;

/// What happened during one session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub frames_rendered: u64,
    pub snapshots: u64,
    pub dropped: u64,
    pub severe_resets: u64,
    /// `Some(winner)` once game over arrived; the inner value is None on a draw.
    pub outcome: Option<Option<Team>>,
}

/// Headless client: joins a match, acknowledges readiness, walks around,
/// attacks the nearest opponent and renders remote players every frame.
pub struct Client {
    socket: UdpSocket,
    server_addr: SocketAddr,
    client_id: Option<u32>,
    connected: bool,

    user_id: UserId,
    name: String,
    match_id: MatchId,
    init: Option<InitState>,
    started: bool,
    position: (f32, f32),

    clock: SessionClock,
    receiver: SnapshotReceiver,
    rng: StdRng,
    last_frame: Option<RenderFrame>,
    summary: RunSummary,
}

impl Client {
    pub async fn new(
        server_addr: &str,
        user_id: UserId,
        name: &str,
        match_id: MatchId,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let server_addr = server_addr.parse()?;

        Ok(Client {
            socket,
            server_addr,
            client_id: None,
            connected: false,
            user_id,
            name: name.to_string(),
            match_id,
            init: None,
            started: false,
            position: (0.0, 0.0),
            clock: SessionClock::start(),
            receiver: SnapshotReceiver::new(ReceiverConfig::default()),
            rng: StdRng::seed_from_u64(user_id),
            last_frame: None,
            summary: RunSummary::default(),
        })
    }

    pub fn receiver(&self) -> &SnapshotReceiver {
        &self.receiver
    }

    pub fn last_frame(&self) -> Option<&RenderFrame> {
        self.last_frame.as_ref()
    }

    async fn connect(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        info!("Connecting to server as user {}...", self.user_id);

        let packet = Packet::Connect {
            user_id: self.user_id,
            name: self.name.clone(),
        };
        self.send_packet(&packet).await?;

        Ok(())
    }

    async fn send_packet(&self, packet: &Packet) -> Result<(), Box<dyn std::error::Error>> {
        let data = serialize(packet)?;
        self.socket.send_to(&data, self.server_addr).await?;
        Ok(())
    }

    /// Returns false once the session is over.
    async fn handle_packet(&mut self, packet: Packet) -> Result<bool, Box<dyn std::error::Error>> {
        match packet {
            Packet::Connected { client_id } => {
                info!("Connected! Client ID: {}", client_id);
                self.client_id = Some(client_id);
                self.connected = true;
                self.send_packet(&Packet::Join {
                    match_id: self.match_id,
                })
                .await?;
            }

            Packet::Joined { ok, match_id } => {
                info!("Joined match {} (ok={})", match_id, ok);
            }

            Packet::JoinError { code, message } => {
                error!("Join failed ({:?}): {}", code, message);
                return Ok(false);
            }

            Packet::Init(init) => {
                if let Some(me) = init.players.iter().find(|p| p.name == self.name) {
                    self.position = (me.x, me.y);
                }
                info!(
                    "Init: match {} on {} ({}), team {}, {} players, status {}",
                    init.match_id,
                    init.map,
                    init.mode,
                    init.your_team,
                    init.players.len(),
                    init.status
                );
                self.init = Some(init);
            }

            Packet::Starting { timeout_ms, .. } => {
                info!("Match starting, acknowledging readiness ({}ms window)", timeout_ms);
                self.send_packet(&Packet::Ready {
                    match_id: self.match_id,
                })
                .await?;
            }

            Packet::Start { countdown } => {
                info!("Match started, countdown {}s", countdown);
                self.started = true;
            }

            Packet::Snapshot(snapshot) => {
                if self.receiver.ingest(snapshot, self.clock.now_ms()) {
                    self.summary.snapshots += 1;
                }
            }

            Packet::HealthUpdate {
                username, health, ..
            } => {
                debug!("{} health {}", username, health);
            }

            Packet::SuperUpdate {
                username, charge, ..
            } => {
                debug!("{} charge {}", username, charge);
            }

            Packet::PlayerDead { username, .. } => {
                info!("{} died", username);
            }

            Packet::PlayerDisconnected {
                name,
                players_remaining,
            } => {
                info!("{} left ({} remaining)", name, players_remaining);
            }

            Packet::PlayerSpecial { username, .. } => {
                debug!("{} used a special", username);
            }

            Packet::PlayerAction { name, kind, .. } => {
                debug!("{} performed {}", name, kind);
            }

            Packet::GameOver {
                winner_team, meta, ..
            } => {
                match winner_team {
                    Some(team) => info!("Game over, {} wins", team),
                    None => info!("Game over, draw"),
                }
                for reward in &meta.rewards {
                    info!(
                        "  {}: {} hits, {} damage, {} kills -> {} coins, {} gems",
                        reward.username,
                        reward.hits,
                        reward.damage,
                        reward.kills,
                        reward.coins_awarded,
                        reward.gems_awarded
                    );
                }
                self.summary.outcome = Some(winner_team);
                return Ok(false);
            }

            Packet::Disconnected { reason } => {
                warn!("Disconnected: {}", reason);
                self.connected = false;
                self.client_id = None;
                return Ok(false);
            }

            _ => {
                warn!("Unexpected packet type");
            }
        }

        Ok(true)
    }

    /// Random walk clamped to the world, sent at roughly snapshot rate.
    async fn send_movement(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        let dx = self.rng.gen_range(-6.0f32..6.0);
        let dy = self.rng.gen_range(-2.0f32..2.0);
        self.position = clamp_to_world(self.position.0 + dx, self.position.1 + dy);

        let packet = Packet::Input(InputFrame {
            x: self.position.0,
            y: self.position.1,
            flip: Some(dx < 0.0),
            animation: Some(if dx.abs() > 1.0 { "run" } else { "idle" }.to_string()),
        });
        self.send_packet(&packet).await
    }

    /// Proposes a basic hit on the closest living opponent seen in the last
    /// rendered frame. The server decides whether it lands.
    async fn send_attack(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        let (Some(init), Some(frame)) = (&self.init, &self.last_frame) else {
            return Ok(());
        };
        let me = self.position;
        let target = init
            .players
            .iter()
            .filter(|p| p.team != init.your_team)
            .filter_map(|p| frame.players.get(&p.name).map(|r| (p, r)))
            .filter(|(_, r)| r.is_alive)
            .min_by(|(_, a), (_, b)| {
                let da = shared::distance(me, (a.x, a.y));
                let db = shared::distance(me, (b.x, b.y));
                da.total_cmp(&db)
            })
            .map(|(p, _)| p.name.clone());

        let Some(target) = target else {
            return Ok(());
        };
        let packet = Packet::Hit(HitProposal {
            attacker: self.name.clone(),
            target,
            attack_type: AttackType::Basic,
            instance_id: None,
        });
        self.send_packet(&packet).await
    }

    fn render_frame(&mut self) {
        let now = self.clock.now_ms();
        if let Some(frame) = self.receiver.render(now) {
            self.summary.frames_rendered += 1;
            self.last_frame = Some(frame);
        }
        self.receiver.spacing_stats().maybe_report(now);
    }

    /// Runs until game over, disconnect, join failure or `max_frames`
    /// rendered frames (0 means no limit).
    pub async fn run(&mut self, max_frames: u64) -> Result<RunSummary, Box<dyn std::error::Error>> {
        self.connect().await?;

        let mut frame_interval = interval(FRAME_INTERVAL);
        frame_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut frame_count: u64 = 0;

        let mut buffer = [0u8; 4096];

        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buffer) => {
                    match result {
                        Ok((len, _)) => {
                            if let Ok(packet) = deserialize::<Packet>(&buffer[0..len]) {
                                if !self.handle_packet(packet).await? {
                                    break;
                                }
                            } else {
                                warn!("Failed to deserialize packet from server");
                            }
                        },
                        Err(e) => error!("Error receiving packet: {}", e),
                    }
                },

                _ = frame_interval.tick() => {
                    frame_count += 1;
                    self.render_frame();

                    if self.started {
                        if frame_count % INPUT_EVERY_FRAMES == 0 {
                            self.send_movement().await?;
                        }
                        if frame_count % ATTACK_EVERY_FRAMES == 0 {
                            self.send_attack().await?;
                        }
                    }

                    if max_frames > 0 && self.summary.frames_rendered >= max_frames {
                        break;
                    }
                },
            }
        }

        if self.connected {
            let _ = self.send_packet(&Packet::Disconnect).await;
        }

        self.summary.dropped = self.receiver.dropped();
        self.summary.severe_resets = self.receiver.severe_resets();
        Ok(self.summary.clone())
    }
}
