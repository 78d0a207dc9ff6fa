//! Integration tests for the session server and snapshot receiver
//!
//! These tests validate cross-crate interactions and real network behavior.

use bincode::{deserialize, serialize};
use client::receiver::{ReceiverConfig, SnapshotReceiver};
use server::config::{RoomConfig, RuntimeConfig};
use server::network::{Server, ServerMessage};
use server::room::{Audience, SessionRoom};
use server::store::{MatchData, MatchParticipant, MatchStatus, MemoryStore};
use shared::{AttackType, HitProposal, InputFrame, Packet, RoomStatus, Team};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::timeout;

fn participant(user_id: u64, name: &str, team: Team) -> MatchParticipant {
    MatchParticipant {
        user_id,
        name: name.to_string(),
        team,
        character: "ninja".to_string(),
        party_id: None,
    }
}

fn duel() -> MatchData {
    MatchData {
        mode: "duel".to_string(),
        map: "lushy".to_string(),
        players: vec![
            participant(1, "alice", Team::Team1),
            participant(2, "bob", Team::Team2),
        ],
    }
}

fn hit(attacker: &str, target: &str) -> HitProposal {
    HitProposal {
        attacker: attacker.to_string(),
        target: target.to_string(),
        attack_type: AttackType::Basic,
        instance_id: None,
    }
}

async fn start_server(
    store: Arc<MemoryStore>,
    room_config: RoomConfig,
) -> (SocketAddr, UnboundedSender<ServerMessage>) {
    let mut server = Server::new("127.0.0.1:0", 16, store, RuntimeConfig::default(), room_config)
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let control = server.control();
    tokio::spawn(async move {
        let _ = server.run().await;
    });
    (addr, control)
}

/// NETWORK PROTOCOL TESTS
mod protocol_tests {
    use super::*;

    async fn recv(socket: &UdpSocket) -> Packet {
        let mut buf = [0u8; 4096];
        let (len, _) = timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
            .await
            .expect("no reply from server")
            .unwrap();
        deserialize(&buf[..len]).unwrap()
    }

    /// Malformed datagrams are dropped without affecting the connection
    #[tokio::test]
    async fn malformed_datagram_is_ignored() {
        let store = Arc::new(MemoryStore::new());
        let (server_addr, control) = start_server(store, RoomConfig::default()).await;

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.send_to(&[0xff, 0x00, 0x13], server_addr).await.unwrap();

        let connect = Packet::Connect {
            user_id: 5,
            name: "eve".to_string(),
        };
        socket
            .send_to(&serialize(&connect).unwrap(), server_addr)
            .await
            .unwrap();

        match recv(&socket).await {
            Packet::Connected { client_id } => assert_eq!(client_id, 1),
            other => panic!("Unexpected packet: {:?}", other),
        }

        let _ = control.send(ServerMessage::Shutdown);
    }

    /// A user id of zero is treated as unauthenticated
    #[tokio::test]
    async fn anonymous_connect_is_refused() {
        let store = Arc::new(MemoryStore::new());
        let (server_addr, control) = start_server(store, RoomConfig::default()).await;

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let connect = Packet::Connect {
            user_id: 0,
            name: String::new(),
        };
        socket
            .send_to(&serialize(&connect).unwrap(), server_addr)
            .await
            .unwrap();

        match recv(&socket).await {
            Packet::Disconnected { reason } => assert_eq!(reason, "unauthorized"),
            other => panic!("Unexpected packet: {:?}", other),
        }

        let _ = control.send(ServerMessage::Shutdown);
    }
}

/// ROOM AND RECEIVER INTEGRATION TESTS
mod room_receiver_tests {
    use super::*;

    fn active_room() -> SessionRoom {
        let mut room = SessionRoom::new(
            1,
            duel(),
            RoomConfig::default(),
            RuntimeConfig::default(),
            0.0,
        );
        room.join(1, 1, 0.0).unwrap();
        room.join(2, 1, 0.0).unwrap();
        room.ready_ack(1, 10.0);
        room.ready_ack(2, 10.0);
        room.poll(3010.0);
        room.drain_outbox();
        assert_eq!(room.status(), RoomStatus::Active);
        room
    }

    /// Server snapshots fed through a jittery link render smoothly
    #[test]
    fn room_snapshots_drive_receiver() {
        let mut room = active_room();
        let mut receiver = SnapshotReceiver::new(ReceiverConfig::default());

        // Server frame loop at ~4 ms granularity for 3 s; bob walks right.
        let mut now = 3010.0;
        let mut x = 400.0f32;
        let mut in_flight: Vec<(f64, shared::Snapshot)> = Vec::new();
        let mut last_tick = 0;
        let mut rendered = 0;

        for step in 0..750u32 {
            now += 4.0;
            x += 0.5;
            room.submit_input(
                2,
                InputFrame {
                    x,
                    y: 400.0,
                    flip: Some(false),
                    animation: Some("run".to_string()),
                },
                now,
            );
            room.poll(now);

            for envelope in room.drain_outbox() {
                if let Packet::Snapshot(snapshot) = envelope.packet {
                    assert_eq!(envelope.audience, Audience::Room);
                    assert!(snapshot.tick_id > last_tick);
                    last_tick = snapshot.tick_id;
                    // Deterministic jitter of 0..90 ms on top of 40 ms latency,
                    // enough to reorder a snapshot now and then.
                    let jitter = ((snapshot.tick_id * 7919) % 91) as f64;
                    in_flight.push((now + 40.0 + jitter, snapshot));
                }
            }

            // Deliver whatever has arrived, in arrival order.
            in_flight.sort_by(|a, b| a.0.total_cmp(&b.0));
            while in_flight.first().is_some_and(|(at, _)| *at <= now) {
                let (at, snapshot) = in_flight.remove(0);
                receiver.ingest(snapshot, at);
            }

            // Render at ~60 Hz.
            if step % 4 == 0 {
                if let Some(frame) = receiver.render(now) {
                    rendered += 1;
                    let bob = &frame.players["bob"];
                    assert!(bob.x >= 400.0 && bob.x <= x);
                    assert!(bob.is_alive);
                }
            }
        }

        assert!(rendered > 100);
        assert_eq!(receiver.severe_resets(), 0);
        // Delay stays inside its band while absorbing the jitter.
        assert!(receiver.delay_ms() >= 120.0 && receiver.delay_ms() <= 300.0);
        // Reordered arrivals are dropped, never rendered backwards.
        assert!(receiver.dropped() > 0);
    }

    /// A full duel settles rewards once and tears down after the grace period
    #[test]
    fn duel_to_game_over() {
        let mut room = active_room();
        let mut now = 4000.0;
        for _ in 0..5 {
            room.handle_hit(1, &hit("alice", "bob"), now);
            now += 100.0;
        }

        assert_eq!(room.status(), RoomStatus::Finished);
        let over: Vec<Packet> = room
            .drain_outbox()
            .into_iter()
            .map(|e| e.packet)
            .filter(|p| matches!(p, Packet::GameOver { .. }))
            .collect();
        assert_eq!(over.len(), 1);

        let settlement = room.take_settlement().unwrap();
        assert_eq!(settlement.winner, Some(Team::Team1));
        assert_eq!(settlement.credits.len(), 2);
        assert!(room.take_settlement().is_none());

        // Hits after game over are ignored.
        assert!(room.handle_hit(2, &hit("bob", "alice"), now).is_none());
        assert!(!room.is_torn_down(now + 1000.0));
        assert!(room.is_torn_down(now + 15_000.0));
    }
}

/// CLIENT-SERVER INTEGRATION TESTS
mod client_server_tests {
    use super::*;
    use client::network::Client;

    /// Two headless clients play a duel to completion over UDP
    #[tokio::test]
    async fn headless_clients_finish_a_match() {
        let store = Arc::new(MemoryStore::new());
        store.insert_match(21, MatchStatus::Live, duel()).await;
        let room_config = RoomConfig {
            start_countdown_secs: 0,
            grace_ms: 500.0,
            ..RoomConfig::default()
        };
        let (server_addr, control) = start_server(Arc::clone(&store), room_config).await;
        let addr = server_addr.to_string();

        let mut alice = Client::new(&addr, 1, "alice", 21).await.unwrap();
        let mut bob = Client::new(&addr, 2, "bob", 21).await.unwrap();

        let (a, b) = timeout(Duration::from_secs(30), async {
            tokio::join!(alice.run(0), bob.run(0))
        })
        .await
        .expect("match did not finish in time");
        let (a, b) = (a.unwrap(), b.unwrap());

        assert!(a.outcome.is_some());
        assert_eq!(a.outcome, b.outcome);
        assert!(a.snapshots > 0 && b.snapshots > 0);
        assert!(a.frames_rendered > 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(store.match_status(21).await, Some(MatchStatus::Completed));
        assert!(store.wallet(1).await.coins > 0);
        assert!(store.wallet(2).await.coins > 0);

        let _ = control.send(ServerMessage::Shutdown);
    }
}
