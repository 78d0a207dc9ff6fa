//! Connection tracking for the session server
//!
//! This module maps transport endpoints to authenticated session members:
//! - Connection lifecycle (connect, identify, disconnect, timeout)
//! - Identity binding from socket address to user id and display name
//! - Match membership so room traffic can be routed per connection
//! - Capacity enforcement and address lookup for outgoing packets
//!
//! A connection is only allowed into a room after it has identified itself.
//! Identity is assumed to be verified upstream; the server trusts the
//! `Connect` packet's user id.

use log::info;
use shared::{MatchId, UserId};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// How long a connection may stay silent before it is dropped.
pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(5);

/// A transport connection and the session identity bound to it
///
/// Each client maintains:
/// - Connection metadata (ID, address, last activity)
/// - The authenticated user behind the connection
/// - The match room it is currently attached to, if any
#[derive(Debug)]
pub struct Client {
    /// Unique connection identifier assigned by the server
    pub id: u32,
    /// Network address for sending responses
    pub addr: SocketAddr,
    /// Last time we received any packet from this client
    pub last_seen: Instant,
    /// Authenticated account behind the connection
    pub user_id: UserId,
    /// Display name, used for logs only; rooms use the roster name
    pub name: String,
    /// Room this connection has joined
    pub match_id: Option<MatchId>,
}

impl Client {
    /// Creates a new client bound to `user_id`
    ///
    /// The client starts outside any room and is marked as recently active.
    pub fn new(id: u32, addr: SocketAddr, user_id: UserId, name: &str) -> Self {
        Self {
            id,
            addr,
            last_seen: Instant::now(),
            user_id,
            name: name.to_string(),
            match_id: None,
        }
    }

    /// Refreshes the activity timestamp
    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    /// Checks if the client has exceeded the connection timeout
    ///
    /// Returns true if no packets have been received from this client
    /// within the specified timeout duration, indicating a likely disconnect.
    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }
}

/// Manages all identified connections
///
/// The ClientManager enforces server capacity, resolves incoming packets to
/// their user, and resolves outgoing per-user packets back to addresses.
/// A user has at most one live connection; identifying again from a new
/// address replaces the old binding, which is how reconnects work.
pub struct ClientManager {
    /// Connected clients indexed by their unique ID
    clients: HashMap<u32, Client>,
    /// Next available client ID for new connections
    next_client_id: u32,
    /// Maximum number of concurrent clients allowed
    max_clients: usize,
}

impl ClientManager {
    /// Creates a new client manager with the specified capacity limit
    ///
    /// Client IDs start from 1 and increment for each new connection.
    pub fn new(max_clients: usize) -> Self {
        Self {
            clients: HashMap::new(),
            next_client_id: 1,
            max_clients,
        }
    }

    /// Registers an identified connection
    ///
    /// Returns `(client_id, replaced)` on success, None if the server is at
    /// capacity. When the same user is already connected from another address
    /// the old connection is dropped and returned so its room membership can
    /// be carried over.
    pub fn add_client(
        &mut self,
        addr: SocketAddr,
        user_id: UserId,
        name: &str,
    ) -> Option<(u32, Option<Client>)> {
        // Re-identifying from the same address keeps the connection.
        if let Some(id) = self.find_client_by_addr(addr) {
            if let Some(client) = self.clients.get_mut(&id) {
                if client.user_id == user_id {
                    client.touch();
                    client.name = name.to_string();
                    return Some((id, None));
                }
            }
            self.remove_client(&id);
        }

        let replaced = self
            .find_client_by_user(user_id)
            .and_then(|id| self.clients.remove(&id));

        // Enforce server capacity limits
        if self.clients.len() >= self.max_clients {
            if let Some(old) = replaced {
                self.clients.insert(old.id, old);
            }
            return None;
        }

        let client_id = self.next_client_id;
        self.next_client_id += 1;

        let mut client = Client::new(client_id, addr, user_id, name);
        if let Some(old) = &replaced {
            client.match_id = old.match_id;
            info!(
                "Client {} replaced connection {} for user {}",
                client_id, old.id, user_id
            );
        }
        info!(
            "Client {} connected from {} as user {} ({})",
            client_id, addr, user_id, name
        );
        self.clients.insert(client_id, client);

        Some((client_id, replaced))
    }

    /// Removes a client from the server
    ///
    /// Returns the removed client so callers can detach it from its room.
    /// This handles both explicit disconnections and timeout cleanup.
    pub fn remove_client(&mut self, client_id: &u32) -> Option<Client> {
        let client = self.clients.remove(client_id)?;
        info!("Client {} disconnected (user {})", client.id, client.user_id);
        Some(client)
    }

    pub fn get(&self, client_id: u32) -> Option<&Client> {
        self.clients.get(&client_id)
    }

    pub fn get_mut(&mut self, client_id: u32) -> Option<&mut Client> {
        self.clients.get_mut(&client_id)
    }

    /// Finds a client ID by their network address
    ///
    /// Used to associate incoming packets with existing client connections.
    /// Returns None if no client is connected from the given address.
    pub fn find_client_by_addr(&self, addr: SocketAddr) -> Option<u32> {
        self.clients
            .iter()
            .find(|(_, client)| client.addr == addr)
            .map(|(id, _)| *id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Client> {
        self.clients.values()
    }

    pub fn find_client_by_user(&self, user_id: UserId) -> Option<u32> {
        self.clients
            .iter()
            .find(|(_, client)| client.user_id == user_id)
            .map(|(id, _)| *id)
    }

    /// Marks a client as active and returns its identity
    pub fn touch(&mut self, client_id: u32) -> Option<&Client> {
        let client = self.clients.get_mut(&client_id)?;
        client.touch();
        Some(client)
    }

    /// Resolves user ids to the addresses of their live connections
    ///
    /// Users without a connection are skipped; the room keeps their state
    /// and they catch up through the next snapshot after reconnecting.
    pub fn addrs_for_users(&self, users: &[UserId]) -> Vec<SocketAddr> {
        users
            .iter()
            .filter_map(|user_id| {
                self.clients
                    .values()
                    .find(|client| client.user_id == *user_id)
                    .map(|client| client.addr)
            })
            .collect()
    }

    /// Checks for and removes timed-out clients
    ///
    /// Automatically disconnects clients that haven't sent packets within
    /// the timeout threshold. Returns the removed clients so their rooms can
    /// be told about the departure.
    pub fn check_timeouts(&mut self, timeout: Duration) -> Vec<Client> {
        let timed_out: Vec<u32> = self
            .clients
            .iter()
            .filter(|(_, client)| client.is_timed_out(timeout))
            .map(|(id, _)| *id)
            .collect();

        timed_out
            .iter()
            .filter_map(|client_id| self.remove_client(client_id))
            .collect()
    }

    /// Returns the number of currently connected clients
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Returns true if no clients are currently connected
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_addr() -> SocketAddr {
        "127.0.0.1:8080".parse().unwrap()
    }

    fn test_addr2() -> SocketAddr {
        "127.0.0.1:8081".parse().unwrap()
    }

    #[test]
    fn test_client_creation() {
        let addr = test_addr();
        let client = Client::new(1, addr, 42, "alice");

        assert_eq!(client.id, 1);
        assert_eq!(client.addr, addr);
        assert_eq!(client.user_id, 42);
        assert_eq!(client.name, "alice");
        assert!(client.match_id.is_none());
    }

    #[test]
    fn test_client_timeout() {
        let mut client = Client::new(1, test_addr(), 42, "alice");

        assert!(!client.is_timed_out(Duration::from_secs(1)));

        client.last_seen = Instant::now() - Duration::from_secs(2);

        assert!(client.is_timed_out(Duration::from_secs(1)));
    }

    #[test]
    fn test_client_manager_creation() {
        let manager = ClientManager::new(5);
        assert_eq!(manager.max_clients, 5);
        assert!(manager.is_empty());
        assert_eq!(manager.len(), 0);
    }

    #[test]
    fn test_add_multiple_clients() {
        let mut manager = ClientManager::new(3);

        let (id1, replaced1) = manager.add_client(test_addr(), 1, "alice").unwrap();
        let (id2, replaced2) = manager.add_client(test_addr2(), 2, "bob").unwrap();

        assert_eq!(id1, 1);
        assert_eq!(id2, 2);
        assert!(replaced1.is_none() && replaced2.is_none());
        assert_eq!(manager.len(), 2);
    }

    #[test]
    fn test_add_client_max_capacity() {
        let mut manager = ClientManager::new(1);

        assert!(manager.add_client(test_addr(), 1, "alice").is_some());
        assert!(manager.add_client(test_addr2(), 2, "bob").is_none());
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_reidentify_same_address_keeps_id() {
        let mut manager = ClientManager::new(2);
        let (id, _) = manager.add_client(test_addr(), 1, "alice").unwrap();
        let (again, replaced) = manager.add_client(test_addr(), 1, "alice").unwrap();
        assert_eq!(id, again);
        assert!(replaced.is_none());
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_reconnect_from_new_address_replaces() {
        let mut manager = ClientManager::new(1);
        let (id, _) = manager.add_client(test_addr(), 1, "alice").unwrap();
        manager.get_mut(id).unwrap().match_id = Some(7);

        // Full server still accepts the same user from a new address.
        let (new_id, replaced) = manager.add_client(test_addr2(), 1, "alice").unwrap();
        assert_ne!(new_id, id);
        assert_eq!(replaced.unwrap().id, id);
        assert_eq!(manager.get(new_id).unwrap().match_id, Some(7));
        assert_eq!(manager.find_client_by_addr(test_addr()), None);
        assert_eq!(manager.addrs_for_users(&[1]), vec![test_addr2()]);
    }

    #[test]
    fn test_remove_client() {
        let mut manager = ClientManager::new(2);
        let (id, _) = manager.add_client(test_addr(), 1, "alice").unwrap();

        let removed = manager.remove_client(&id).unwrap();
        assert_eq!(removed.user_id, 1);
        assert!(manager.is_empty());
        assert!(manager.remove_client(&id).is_none());
    }

    #[test]
    fn test_find_client_by_addr_and_user() {
        let mut manager = ClientManager::new(2);
        let (id, _) = manager.add_client(test_addr(), 9, "carol").unwrap();

        assert_eq!(manager.find_client_by_addr(test_addr()), Some(id));
        assert_eq!(manager.find_client_by_addr(test_addr2()), None);
        assert_eq!(manager.find_client_by_user(9), Some(id));
        assert_eq!(manager.find_client_by_user(10), None);
    }

    #[test]
    fn test_addrs_for_users_skips_offline() {
        let mut manager = ClientManager::new(3);
        manager.add_client(test_addr(), 1, "alice").unwrap();
        manager.add_client(test_addr2(), 2, "bob").unwrap();

        let addrs = manager.addrs_for_users(&[2, 3, 1]);
        assert_eq!(addrs, vec![test_addr2(), test_addr()]);
    }

    #[test]
    fn test_check_timeouts() {
        let mut manager = ClientManager::new(3);
        let (id1, _) = manager.add_client(test_addr(), 1, "alice").unwrap();
        manager.add_client(test_addr2(), 2, "bob").unwrap();

        manager.get_mut(id1).unwrap().last_seen = Instant::now() - Duration::from_secs(10);

        let timed_out = manager.check_timeouts(CLIENT_TIMEOUT);
        assert_eq!(timed_out.len(), 1);
        assert_eq!(timed_out[0].user_id, 1);
        assert_eq!(manager.len(), 1);
    }
}
