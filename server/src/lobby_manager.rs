//! Owns every lobby and the client-to-player links.
//!
//! The manager is the entry point for everything the coordination loop processes: client
//! messages, disconnections and timer callbacks all go through it, and after each unit of
//! work it enforces the lobby-level invariants. Empty lobbies are forgotten immediately, and
//! a lobby whose handling raised an invariant violation is aborted: it is forgotten and its
//! clients are queued for disconnection.

use log::{debug, error, info};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::client::{ClientId, Connection};
use crate::config::GameConfig;
use crate::error::{GameError, GameResult};
use crate::lobby::{Lobby, LobbyCode};
use crate::minigame::Registry;
use crate::recorder::RecordSink;
use crate::roster::{PlayerId, Roster};
use crate::ship::{Ship, ShipId};
use crate::timer::Scheduler;
use crate::utils::random_lobby_code;
use shared::Message;

/// Shared, read-only environment handed to every lobby and ship.
pub struct GameEnv {
    pub config: GameConfig,
    pub registry: Registry,
    pub scheduler: Scheduler,
    pub sink: Option<Arc<dyn RecordSink>>,
    ship_ids: AtomicU64,
}

impl GameEnv {
    pub fn new(config: GameConfig, registry: Registry, scheduler: Scheduler) -> Self {
        GameEnv {
            config,
            registry,
            scheduler,
            sink: None,
            ship_ids: AtomicU64::new(1),
        }
    }

    /// Enables session recording into `sink`.
    pub fn with_sink(mut self, sink: Arc<dyn RecordSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn next_ship_id(&self) -> ShipId {
        ShipId(self.ship_ids.fetch_add(1, Ordering::Relaxed))
    }
}

pub struct LobbyManager {
    env: Arc<GameEnv>,
    lobbies: HashMap<LobbyCode, Lobby>,
    links: HashMap<ClientId, (LobbyCode, PlayerId)>,
    doomed: Vec<ClientId>,
}

impl LobbyManager {
    pub fn new(env: Arc<GameEnv>) -> Self {
        LobbyManager {
            env,
            lobbies: HashMap::new(),
            links: HashMap::new(),
            doomed: Vec::new(),
        }
    }

    pub fn env(&self) -> &Arc<GameEnv> {
        &self.env
    }

    pub fn len(&self) -> usize {
        self.lobbies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lobbies.is_empty()
    }

    pub fn lobby(&self, code: &LobbyCode) -> Option<&Lobby> {
        self.lobbies.get(code)
    }

    pub fn lobby_codes(&self) -> Vec<LobbyCode> {
        self.lobbies.keys().cloned().collect()
    }

    /// The lobby and player a client is linked to, if any.
    pub fn player_of(&self, client: ClientId) -> Option<(LobbyCode, PlayerId)> {
        self.links.get(&client).cloned()
    }

    /// Clients of aborted lobbies. The caller must drop their connections.
    pub fn take_doomed(&mut self) -> Vec<ClientId> {
        std::mem::take(&mut self.doomed)
    }

    fn new_code(&self) -> LobbyCode {
        let mut rng = rand::thread_rng();

        loop {
            let code = LobbyCode::new(random_lobby_code(&mut rng));

            if !self.lobbies.contains_key(&code) {
                return code;
            }
        }
    }

    /// Handles one message from a client. Lobby creation and joining are handled here, and
    /// everything else goes to the sender's lobby.
    pub fn receive(&mut self, conn: &Connection, message: &Message) -> GameResult {
        match message.kind() {
            "lobby_create" => self.create_lobby(conn.clone()),
            "lobby_join" => match message.get_str("lobby_id") {
                Ok(code) => self.join(LobbyCode::new(code), conn.clone()),
                Err(_) => conn.send(&Message::new("lobby_join_format_error")),
            },
            _ => match self.player_of(conn.id) {
                Some((code, player)) => {
                    self.with_lobby(&code, |lobby| lobby.handle_message(player, message))
                }
                None => conn.send(&Message::new("client_unknown_non_lobby_message")),
            },
        }
    }

    pub fn create_lobby(&mut self, conn: Connection) -> GameResult {
        if self.links.contains_key(&conn.id) {
            return conn.send(&Message::new("client_already_in_lobby_error"));
        }

        let code = self.new_code();
        info!("lobby {}: created", code);

        self.lobbies
            .insert(code.clone(), Lobby::new(code.clone(), Arc::clone(&self.env)));

        self.join(code, conn)
    }

    pub fn join(&mut self, code: LobbyCode, conn: Connection) -> GameResult {
        if self.links.contains_key(&conn.id) {
            return conn.send(&Message::new("client_already_in_lobby_error"));
        }

        let Some(lobby) = self.lobbies.get_mut(&code) else {
            info!("client {} asked for unknown lobby {}", conn.id, code);
            return conn.send(&Message::new("lobby_not_found"));
        };

        let client = conn.id;
        let joined = lobby.handle_join(conn);

        if let Some(player) = lobby.player_for_client(client) {
            self.links.insert(client, (code.clone(), player));
        }

        self.finish_turn(&code, joined)
    }

    /// Runs the leave path for a client whose connection is gone.
    pub fn disconnect(&mut self, client: ClientId) -> GameResult {
        let Some((code, player)) = self.player_of(client) else {
            debug!("client {} left without a lobby", client);
            return Ok(());
        };

        self.with_lobby(&code, |lobby| lobby.handle_disconnection(player))
    }

    /// Runs timer work against a ship. Work for a lobby or ship that no longer exists is
    /// dropped.
    pub fn with_ship<F>(&mut self, code: &LobbyCode, ship: ShipId, f: F) -> GameResult
    where
        F: FnOnce(&mut Ship, &mut Roster) -> GameResult,
    {
        if !self.lobbies.contains_key(code) {
            debug!("lobby {} is gone; dropping callback for {}", code, ship);
            return Ok(());
        }

        self.with_lobby(code, |lobby| lobby.with_ship(ship, f))
    }

    fn with_lobby<F>(&mut self, code: &LobbyCode, f: F) -> GameResult
    where
        F: FnOnce(&mut Lobby) -> GameResult,
    {
        let Some(lobby) = self.lobbies.get_mut(code) else {
            return Err(GameError::invariant(format!("link to missing lobby {}", code)));
        };

        let result = f(lobby);
        self.finish_turn(code, result)
    }

    /// Drops stale links, then forgets the lobby if it is empty or aborts it if `result`
    /// carries an invariant violation.
    fn finish_turn(&mut self, code: &LobbyCode, result: GameResult) -> GameResult {
        let Some(lobby) = self.lobbies.get(code) else {
            return result;
        };

        self.links
            .retain(|_, (c, p)| c != code || lobby.roster().contains(*p));

        let empty = lobby.roster().is_empty();

        if result.as_ref().err().map_or(false, GameError::is_invariant) {
            self.abort(code);
        } else if empty {
            info!("lobby {}: empty, forgetting it", code);
            self.forget(code);
        }

        result
    }

    fn forget(&mut self, code: &LobbyCode) -> Option<Lobby> {
        let mut lobby = self.lobbies.remove(code)?;
        lobby.shutdown();
        self.links.retain(|_, (c, _)| c != code);
        Some(lobby)
    }

    fn abort(&mut self, code: &LobbyCode) {
        let Some(lobby) = self.forget(code) else {
            return;
        };

        error!(
            "lobby {}: aborted after invariant violation, disconnecting {} client(s)",
            code,
            lobby.roster().len()
        );

        for player in lobby.roster().iter() {
            player.conn.close();
            self.doomed.push(player.client());
        }
    }
}
