//! Connection bookkeeping for the coordination loop
//!
//! This module tracks which sockets are currently attached to the server:
//! - Registration of accepted connections, bounded by a capacity limit
//! - Lookup of a connection's outbound handle by client id
//! - Removal when a socket closes or is forcibly dropped
//!
//! The client manager knows nothing about lobbies or players; the lobby manager links
//! clients to players once they create or join a lobby.

use log::{info, warn};
use std::collections::HashMap;

use crate::client::{ClientId, Connection};
use shared::Message;

/// Tracks live connections and enforces the server's capacity.
///
/// Owned by the hub and only touched from the coordination loop, so it needs no locking.
pub struct ClientManager {
    /// Connected clients indexed by their id
    clients: HashMap<ClientId, Connection>,
    /// Maximum number of concurrent clients allowed
    max_clients: usize,
}

impl ClientManager {
    pub fn new(max_clients: usize) -> Self {
        Self {
            clients: HashMap::new(),
            max_clients,
        }
    }

    /// Registers a freshly accepted connection.
    ///
    /// When the server is at capacity the client is told `server_full`, its socket is closed
    /// and `false` is returned.
    pub fn add_client(&mut self, conn: Connection) -> bool {
        if self.clients.len() >= self.max_clients {
            warn!("Refusing client {} from {}: server full", conn.id, conn.addr);

            if let Err(e) = conn.send(&Message::new("server_full")) {
                warn!("Could not tell client {} the server is full: {}", conn.id, e);
            }
            conn.close();

            return false;
        }

        info!("Client {} connected from {}", conn.id, conn.addr);
        self.clients.insert(conn.id, conn);

        true
    }

    /// Forgets a client. Returns its connection if it was still registered.
    pub fn remove_client(&mut self, client_id: ClientId) -> Option<Connection> {
        let conn = self.clients.remove(&client_id)?;
        info!("Client {} disconnected", client_id);

        Some(conn)
    }

    pub fn get(&self, client_id: ClientId) -> Option<&Connection> {
        self.clients.get(&client_id)
    }

    pub fn contains(&self, client_id: ClientId) -> bool {
        self.clients.contains_key(&client_id)
    }

    /// Returns the number of currently connected clients
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
