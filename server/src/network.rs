//! Server network layer: UDP transport, connection identity and routing
//! into match rooms.

use crate::client_manager::{ClientManager, CLIENT_TIMEOUT};
use crate::config::{RoomConfig, RuntimeConfig};
use crate::hub::{Outbound, RoomCommand, SessionHub};
use crate::room::JoinError;
use crate::store::MatchStore;
use bincode::{deserialize, serialize};
use log::{debug, error, info, warn};
use shared::{JoinFailure, MatchId, Packet, UserId};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};
use tokio::time::interval;

const STATS_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Encode error: {0}")]
    Encode(#[from] bincode::Error),
}

/// Messages sent from network tasks to main server loop
#[derive(Debug)]
pub enum ServerMessage {
    PacketReceived {
        packet: Packet,
        addr: SocketAddr,
    },
    ClientTimeout {
        client_id: u32,
        user_id: UserId,
        match_id: Option<MatchId>,
    },
    Shutdown,
}

/// Messages sent from the main loop and the rooms to the sender task
#[derive(Debug)]
pub enum GameMessage {
    SendPacket { packet: Packet, addr: SocketAddr },
    SendToUsers { packet: Packet, users: Vec<UserId> },
}

impl From<Outbound> for GameMessage {
    fn from(outbound: Outbound) -> Self {
        GameMessage::SendToUsers {
            packet: outbound.packet,
            users: outbound.recipients,
        }
    }
}

/// Main server coordinating networking and the room hub
pub struct Server {
    socket: Arc<UdpSocket>,
    clients: Arc<RwLock<ClientManager>>,
    hub: SessionHub,

    // Communication channels
    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
    game_tx: mpsc::UnboundedSender<GameMessage>,
    game_rx: Option<mpsc::UnboundedReceiver<GameMessage>>,
    outbound_rx: Option<mpsc::UnboundedReceiver<Outbound>>,
    closed_rx: mpsc::UnboundedReceiver<MatchId>,
}

impl Server {
    pub async fn new(
        addr: &str,
        max_clients: usize,
        store: Arc<dyn MatchStore>,
        runtime: RuntimeConfig,
        room_config: RoomConfig,
    ) -> Result<Self, NetworkError> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        info!("Server listening on {}", socket.local_addr()?);

        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let (game_tx, game_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (hub, closed_rx) = SessionHub::new(store, runtime, room_config, outbound_tx);

        Ok(Server {
            socket,
            clients: Arc::new(RwLock::new(ClientManager::new(max_clients))),
            hub,
            server_tx,
            server_rx,
            game_tx,
            game_rx: Some(game_rx),
            outbound_rx: Some(outbound_rx),
            closed_rx,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, NetworkError> {
        Ok(self.socket.local_addr()?)
    }

    /// Sender for injecting messages into the main loop, e.g. `Shutdown`.
    pub fn control(&self) -> mpsc::UnboundedSender<ServerMessage> {
        self.server_tx.clone()
    }

    /// Spawns task that continuously listens for incoming packets
    fn spawn_network_receiver(&self) {
        let socket = Arc::clone(&self.socket);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; 4096];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        if let Ok(packet) = deserialize::<Packet>(&buffer[0..len]) {
                            if let Err(e) =
                                server_tx.send(ServerMessage::PacketReceived { packet, addr })
                            {
                                error!("Failed to send packet to main loop: {}", e);
                                break;
                            }
                        } else {
                            warn!("Failed to deserialize packet from {}", addr);
                        }
                    }
                    Err(e) => {
                        error!("Error receiving packet: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    /// Spawns task that processes the outgoing packet queue, including
    /// everything the rooms emit
    fn spawn_network_sender(&mut self) {
        let socket = Arc::clone(&self.socket);
        let clients = Arc::clone(&self.clients);
        let (Some(mut game_rx), Some(mut outbound_rx)) =
            (self.game_rx.take(), self.outbound_rx.take())
        else {
            return;
        };

        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    Some(message) = game_rx.recv() => message,
                    Some(outbound) = outbound_rx.recv() => GameMessage::from(outbound),
                    else => break,
                };

                match message {
                    GameMessage::SendPacket { packet, addr } => {
                        if let Err(e) = send_packet_impl(&socket, &packet, addr).await {
                            error!("Failed to send packet to {}: {}", addr, e);
                        }
                    }
                    GameMessage::SendToUsers { packet, users } => {
                        let addrs = {
                            let clients_guard = clients.read().await;
                            clients_guard.addrs_for_users(&users)
                        };

                        for addr in addrs {
                            if let Err(e) = send_packet_impl(&socket, &packet, addr).await {
                                error!("Failed to send to {}: {}", addr, e);
                            }
                        }
                    }
                }
            }
        });
    }

    /// Spawns task that monitors client timeouts
    fn spawn_timeout_checker(&self) {
        let clients = Arc::clone(&self.clients);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut interval = interval(Duration::from_secs(1));

            loop {
                interval.tick().await;

                let timed_out = {
                    let mut clients_guard = clients.write().await;
                    clients_guard.check_timeouts(CLIENT_TIMEOUT)
                };

                for client in timed_out {
                    let message = ServerMessage::ClientTimeout {
                        client_id: client.id,
                        user_id: client.user_id,
                        match_id: client.match_id,
                    };
                    if let Err(e) = server_tx.send(message) {
                        error!("Failed to send timeout message: {}", e);
                        return;
                    }
                }
            }
        });
    }

    fn send_packet(&self, packet: Packet, addr: SocketAddr) {
        if let Err(e) = self.game_tx.send(GameMessage::SendPacket { packet, addr }) {
            error!("Failed to queue packet for sending: {}", e);
        }
    }

    fn send_join_error(&self, error: &JoinError, addr: SocketAddr) {
        self.send_packet(
            Packet::JoinError {
                code: error.code(),
                message: error.to_string(),
            },
            addr,
        );
    }

    /// Identity and room of the connection behind `addr`, refreshing its
    /// activity timestamp.
    async fn identify(&self, addr: SocketAddr) -> Option<(u32, UserId, Option<MatchId>)> {
        let mut clients = self.clients.write().await;
        let client_id = clients.find_client_by_addr(addr)?;
        clients
            .touch(client_id)
            .map(|c| (c.id, c.user_id, c.match_id))
    }

    async fn set_match(&self, client_id: u32, match_id: Option<MatchId>) {
        let mut clients = self.clients.write().await;
        if let Some(client) = clients.get_mut(client_id) {
            client.match_id = match_id;
        }
    }

    /// Processes incoming packets and routes room traffic to the hub
    async fn handle_packet(&mut self, packet: Packet, addr: SocketAddr) {
        if let Packet::Connect { user_id, name } = packet {
            self.handle_connect(user_id, &name, addr).await;
            return;
        }

        let Some((client_id, user_id, match_id)) = self.identify(addr).await else {
            match packet {
                Packet::Join { .. } => {
                    self.send_join_error(&JoinError::Unidentified, addr);
                }
                _ => debug!("Ignoring packet from unidentified {}", addr),
            }
            return;
        };

        match packet {
            Packet::Join { match_id: target } => {
                if let Some(current) = match_id.filter(|m| *m != target) {
                    self.hub.handle_leave(user_id, current).await;
                    self.set_match(client_id, None).await;
                }

                match self.hub.handle_join(user_id, target).await {
                    Ok(outcome) => {
                        debug!("User {} joined match {} ({:?})", user_id, target, outcome);
                        self.set_match(client_id, Some(target)).await;
                    }
                    Err(e) => {
                        info!("User {} failed to join match {}: {}", user_id, target, e);
                        self.send_join_error(&e, addr);
                    }
                }
            }

            Packet::Leave => {
                if let Some(current) = match_id {
                    self.hub.handle_leave(user_id, current).await;
                    self.set_match(client_id, None).await;
                }
            }

            Packet::Disconnect => {
                let removed = {
                    let mut clients = self.clients.write().await;
                    clients.remove_client(&client_id)
                };
                if let Some(current) = removed.and_then(|c| c.match_id) {
                    self.hub.handle_leave(user_id, current).await;
                }
            }

            Packet::Ready { match_id: target } => {
                if match_id == Some(target) {
                    self.hub.route(target, RoomCommand::Ready { user_id });
                }
            }

            packet => {
                let Some(current) = match_id else {
                    debug!("User {} sent room traffic outside a room", user_id);
                    return;
                };
                match room_command(user_id, packet) {
                    Some(command) => {
                        if !self.hub.route(current, command) {
                            debug!("Room {} is gone, dropping packet", current);
                        }
                    }
                    None => warn!("Unexpected packet type from client at {}", addr),
                }
            }
        }
    }

    async fn handle_connect(&mut self, user_id: UserId, name: &str, addr: SocketAddr) {
        if user_id == 0 {
            self.send_packet(
                Packet::Disconnected {
                    reason: "unauthorized".to_string(),
                },
                addr,
            );
            return;
        }

        let added = {
            let mut clients = self.clients.write().await;
            clients.add_client(addr, user_id, name)
        };

        match added {
            Some((client_id, _)) => {
                self.send_packet(Packet::Connected { client_id }, addr);
            }
            None => {
                self.send_packet(
                    Packet::Disconnected {
                        reason: "Server full".to_string(),
                    },
                    addr,
                );
            }
        }
    }

    /// Forgets rooms whose grace period ended and detaches their members.
    async fn handle_room_closed(&mut self, match_id: MatchId) {
        self.hub.remove_room(match_id);
        let mut clients = self.clients.write().await;
        let members: Vec<u32> = clients
            .iter()
            .filter(|c| c.match_id == Some(match_id))
            .map(|c| c.id)
            .collect();
        for client_id in members {
            if let Some(client) = clients.get_mut(client_id) {
                client.match_id = None;
            }
        }
    }

    async fn log_stats(&self) {
        let stats = self.hub.stats().await;
        if stats.active_rooms == 0 {
            return;
        }
        info!("Active rooms: {}", stats.active_rooms);
        for room in stats.rooms {
            debug!(
                "  match {}: {} players, {}, up {:.0}s",
                room.match_id,
                room.connected,
                room.status,
                room.uptime_ms / 1000.0
            );
        }
    }

    /// Main server loop coordinating all operations
    pub async fn run(&mut self) -> Result<(), NetworkError> {
        // Initialize concurrent tasks
        self.spawn_network_receiver();
        self.spawn_network_sender();
        self.spawn_timeout_checker();

        let mut stats_interval = interval(STATS_INTERVAL);

        info!("Server started successfully");

        loop {
            tokio::select! {
                message = self.server_rx.recv() => {
                    match message {
                        Some(ServerMessage::PacketReceived { packet, addr }) => {
                            self.handle_packet(packet, addr).await;
                        }
                        Some(ServerMessage::ClientTimeout { client_id, user_id, match_id }) => {
                            info!("Client {} timed out", client_id);
                            if let Some(match_id) = match_id {
                                self.hub.handle_leave(user_id, match_id).await;
                            }
                        }
                        Some(ServerMessage::Shutdown) | None => {
                            info!("Server shutting down");
                            break;
                        }
                    }
                }

                Some(match_id) = self.closed_rx.recv() => {
                    self.handle_room_closed(match_id).await;
                }

                _ = stats_interval.tick() => {
                    self.log_stats().await;
                }
            }
        }

        Ok(())
    }
}

/// Maps in-room packets to room commands. Returns None for packets that do
/// not belong to a room.
fn room_command(user_id: UserId, packet: Packet) -> Option<RoomCommand> {
    let command = match packet {
        Packet::Input(input) => RoomCommand::Input { user_id, input },
        Packet::Action { kind, data } => RoomCommand::Action {
            user_id,
            kind,
            data,
        },
        Packet::Special => RoomCommand::Special { user_id },
        Packet::Hit(proposal) => RoomCommand::Hit { user_id, proposal },
        Packet::Heal(proposal) => RoomCommand::Heal { user_id, proposal },
        _ => return None,
    };
    Some(command)
}

async fn send_packet_impl(
    socket: &UdpSocket,
    packet: &Packet,
    addr: SocketAddr,
) -> Result<(), NetworkError> {
    let data = serialize(packet)?;
    socket.send_to(&data, addr).await?;
    Ok(())
}

/// Join failure code carried by a `JoinError` packet, if any.
pub fn join_failure(packet: &Packet) -> Option<JoinFailure> {
    match packet {
        Packet::JoinError { code, .. } => Some(*code),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MatchData, MatchStatus, MemoryStore};
    use shared::{AttackType, HitProposal, InputFrame, Team};
    use tokio::time::timeout;

    #[test]
    fn test_room_command_mapping() {
        let input = InputFrame {
            x: 1.0,
            y: 2.0,
            flip: None,
            animation: None,
        };
        assert!(matches!(
            room_command(3, Packet::Input(input)),
            Some(RoomCommand::Input { user_id: 3, .. })
        ));
        assert!(matches!(
            room_command(3, Packet::Special),
            Some(RoomCommand::Special { user_id: 3 })
        ));
        assert!(matches!(
            room_command(
                3,
                Packet::Hit(HitProposal {
                    attacker: "a".to_string(),
                    target: "b".to_string(),
                    attack_type: AttackType::Basic,
                    instance_id: None,
                })
            ),
            Some(RoomCommand::Hit { user_id: 3, .. })
        ));
        assert!(room_command(3, Packet::Leave).is_none());
        assert!(room_command(3, Packet::Connected { client_id: 1 }).is_none());
    }

    #[test]
    fn test_outbound_becomes_user_send() {
        let message = GameMessage::from(Outbound {
            recipients: vec![1, 2],
            packet: Packet::Special,
        });
        match message {
            GameMessage::SendToUsers { users, .. } => assert_eq!(users, vec![1, 2]),
            _ => panic!("Unexpected message type"),
        }
    }

    async fn recv_packet(socket: &UdpSocket) -> Packet {
        let mut buf = [0u8; 4096];
        let (len, _) = timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
            .await
            .expect("timed out waiting for server")
            .unwrap();
        deserialize(&buf[..len]).unwrap()
    }

    async fn send(socket: &UdpSocket, server: SocketAddr, packet: &Packet) {
        socket
            .send_to(&serialize(packet).unwrap(), server)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_connect_and_join_errors() {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_match(
                8,
                MatchStatus::Live,
                MatchData {
                    mode: "duel".to_string(),
                    map: "lushy".to_string(),
                    players: vec![crate::player::tests::participant(1, "alice", Team::Team1)],
                },
            )
            .await;

        let mut server = Server::new(
            "127.0.0.1:0",
            8,
            store,
            RuntimeConfig::default(),
            RoomConfig::default(),
        )
        .await
        .unwrap();
        let server_addr = server.local_addr().unwrap();
        let control = server.control();
        tokio::spawn(async move {
            let _ = server.run().await;
        });

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        // Joining before identifying is refused.
        send(&socket, server_addr, &Packet::Join { match_id: 8 }).await;
        assert_eq!(
            join_failure(&recv_packet(&socket).await),
            Some(JoinFailure::Unauthorized)
        );

        send(
            &socket,
            server_addr,
            &Packet::Connect {
                user_id: 1,
                name: "alice".to_string(),
            },
        )
        .await;
        assert!(matches!(
            recv_packet(&socket).await,
            Packet::Connected { .. }
        ));

        send(&socket, server_addr, &Packet::Join { match_id: 0 }).await;
        assert_eq!(
            join_failure(&recv_packet(&socket).await),
            Some(JoinFailure::BadMatchId)
        );

        send(&socket, server_addr, &Packet::Join { match_id: 77 }).await;
        assert_eq!(
            join_failure(&recv_packet(&socket).await),
            Some(JoinFailure::JoinFailed)
        );

        send(&socket, server_addr, &Packet::Join { match_id: 8 }).await;
        assert!(matches!(
            recv_packet(&socket).await,
            Packet::Joined { ok: true, match_id: 8 }
        ));
        assert!(matches!(recv_packet(&socket).await, Packet::Init(_)));

        let _ = control.send(ServerMessage::Shutdown);
    }
}
