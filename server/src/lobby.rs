//! A lobby: its roster, the pre-game staging activity and the ship while a session runs.
//!
//! The lobby is also where messages are routed by activity. Every player's
//! [`ActivityKind`] decides whether the staging activity, the ship or a minigame context
//! sees their message.

use log::{info, warn};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use crate::activity::Activity;
use crate::client::{ClientId, Connection};
use crate::error::{join_results, GameError, GameResult};
use crate::lobby_manager::GameEnv;
use crate::roster::{ActivityKind, PlayerId, Roster, TeamIndex};
use crate::ship::{Ship, ShipId};
use crate::utils::random_username;
use shared::{Message, FULL_TEAM_SIZE};

/// Short code players type to join a lobby.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LobbyCode(String);

impl LobbyCode {
    pub fn new(code: impl Into<String>) -> Self {
        LobbyCode(code.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LobbyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Pre-game staging: team changes and the ready check.
#[derive(Debug)]
pub struct LobbyActivity {
    code: LobbyCode,
    allow_smaller: bool,
    ready: BTreeSet<PlayerId>,
    start_requested: bool,
}

impl LobbyActivity {
    pub fn new(code: LobbyCode, allow_smaller: bool) -> Self {
        LobbyActivity {
            code,
            allow_smaller,
            ready: BTreeSet::new(),
            start_requested: false,
        }
    }

    pub fn is_player_ready(&self, player: PlayerId) -> bool {
        self.ready.contains(&player)
    }

    pub fn ready_count(&self) -> usize {
        self.ready.len()
    }

    /// Whether the teams allow a game to start: equal and non-empty, or full 3v3 teams when
    /// smaller lobbies are not allowed.
    pub fn teams_ready(&self, roster: &Roster) -> bool {
        let n0 = roster.team(TeamIndex::Zero).len();
        let n1 = roster.team(TeamIndex::One).len();

        if self.allow_smaller {
            return n0 > 0 && n0 == n1;
        }

        n0 == FULL_TEAM_SIZE && n1 == FULL_TEAM_SIZE
    }

    fn team_change(&mut self, roster: &mut Roster, player: PlayerId, message: &Message) -> GameResult {
        let Some(team) = message.get_i64("team").ok().and_then(TeamIndex::from_number) else {
            return roster.send(player, &Message::new("lobby_team_change_format_error"));
        };

        let name = roster.name_of(player);
        info!("lobby {}: player {} changes to team {}", self.code, name, team.index());

        roster.switch_team(player, team)?;

        // Any team change makes everyone unready.
        self.ready.clear();

        let msg = Message::new("lobby_peer_team_change")
            .with("their_name", name)
            .with("team", team);

        roster.send_each(roster.activity_peers(player), &msg)
    }

    fn ready_change(&mut self, roster: &mut Roster, player: PlayerId, message: &Message) -> GameResult {
        match message.get_bool("ready") {
            Ok(true) => self.ready_up(roster, player),
            Ok(false) => self.unready(roster, player),
            Err(_) => roster.send(player, &Message::new("lobby_ready_change_format_error")),
        }
    }

    fn notify_ready(&self, roster: &Roster, player: PlayerId, ready: bool) -> GameResult {
        let msg = Message::new("lobby_peer_ready_change")
            .with("their_name", roster.name_of(player))
            .with("ready", ready);

        roster.send_each(roster.activity_peers(player), &msg)
    }

    fn ready_up(&mut self, roster: &mut Roster, player: PlayerId) -> GameResult {
        if !self.teams_ready(roster) {
            return roster.send(player, &Message::new("lobby_ready_change_teams_not_ready_error"));
        }

        info!("lobby {}: player {} ready", self.code, roster.name_of(player));

        self.ready.insert(player);
        let notified = self.notify_ready(roster, player, true);

        if self.ready.len() == roster.len() {
            info!("lobby {}: all {} players ready", self.code, roster.len());
            self.start_requested = true;
        }

        notified
    }

    fn unready(&mut self, roster: &mut Roster, player: PlayerId) -> GameResult {
        info!("lobby {}: player {} unready", self.code, roster.name_of(player));

        self.ready.remove(&player);
        self.notify_ready(roster, player, false)
    }

    fn bye(&mut self, roster: &mut Roster, player: PlayerId) -> GameResult {
        let removed = roster.remove(player)?;
        info!("lobby {}: removing player {}", self.code, removed.name);

        self.ready.remove(&player);

        roster.broadcast(&Message::new("lobby_peer_left").with("their_name", removed.name))
    }
}

impl Activity for LobbyActivity {
    fn start(&mut self, _roster: &mut Roster) -> GameResult {
        Ok(())
    }

    fn handle_message(&mut self, roster: &mut Roster, player: PlayerId, message: &Message) -> GameResult {
        match message.kind() {
            "lobby_team_change" => self.team_change(roster, player, message),
            "lobby_ready_change" => self.ready_change(roster, player, message),
            "lobby_bye" => self.bye(roster, player),
            other => roster.send(
                player,
                &Message::new("lobby_unrecognised_message_type").with("bad_type", other),
            ),
        }
    }

    fn handle_disconnection(&mut self, roster: &mut Roster, player: PlayerId) -> GameResult {
        self.bye(roster, player)
    }
}

pub struct Lobby {
    code: LobbyCode,
    env: Arc<GameEnv>,
    roster: Roster,
    activity: LobbyActivity,
    ship: Option<Ship>,
}

impl Lobby {
    pub fn new(code: LobbyCode, env: Arc<GameEnv>) -> Self {
        let activity = LobbyActivity::new(code.clone(), env.config.allow_smaller_lobbies);

        Lobby {
            code,
            env,
            roster: Roster::new(),
            activity,
            ship: None,
        }
    }

    pub fn code(&self) -> &LobbyCode {
        &self.code
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn activity(&self) -> &LobbyActivity {
        &self.activity
    }

    pub fn ship(&self) -> Option<&Ship> {
        self.ship.as_ref()
    }

    pub fn in_game(&self) -> bool {
        self.ship.is_some()
    }

    pub fn player_for_client(&self, client: ClientId) -> Option<PlayerId> {
        self.roster.iter().find(|p| p.client() == client).map(|p| p.id)
    }

    /// Adds the client as a new player unless the lobby is full or a session is running.
    pub fn handle_join(&mut self, conn: Connection) -> GameResult {
        info!("lobby {}: join request from {}", self.code, conn.addr);

        if self.in_game() {
            info!("lobby {}: refusing join while in game", self.code);
            return conn.send(&Message::new("lobby_in_game"));
        }

        if self.roster.len() >= self.env.config.max_lobby_players {
            info!("lobby {}: full", self.code);
            return conn.send(&Message::new("lobby_full"));
        }

        let name = random_username(&mut rand::thread_rng(), |n| self.roster.is_name_taken(n));
        let addr = conn.addr;
        let player = self.roster.add_player(name, conn);

        let joined = self.roster.player(player)?;
        info!(
            "lobby {}: added player {} from {} to team {}",
            self.code,
            joined.name,
            addr,
            joined.team.index()
        );

        let welcome = Message::new("lobby_welcome")
            .with("your_name", joined.name.clone())
            .with("your_team", joined.team)
            .with("lobby_id", self.code.as_str())
            .with("peer_teams", self.roster.team_map(Some(player)));

        let peer = Message::new("lobby_peer_joined")
            .with("their_name", joined.name.clone())
            .with("their_team", joined.team);

        join_results([
            self.roster.send(player, &welcome),
            self.roster.send_each(self.roster.activity_peers(player), &peer),
        ])
    }

    /// Routes a message to the sender's current activity.
    pub fn handle_message(&mut self, player: PlayerId, message: &Message) -> GameResult {
        let activity = self.roster.player(player)?.activity;

        let handled = match activity {
            ActivityKind::Lobby => self.activity.handle_message(&mut self.roster, player, message),
            ActivityKind::Ship => {
                let ship = self.ship.as_mut().ok_or_else(no_ship)?;
                ship.handle_message(&mut self.roster, player, message)
            }
            ActivityKind::Minigame(ctx) => {
                let ship = self.ship.as_mut().ok_or_else(no_ship)?;
                ship.handle_minigame_message(&mut self.roster, ctx, player, message)
            }
        };

        join_results([handled, self.after_turn()])
    }

    pub fn handle_disconnection(&mut self, player: PlayerId) -> GameResult {
        let activity = self.roster.player(player)?.activity;
        info!(
            "lobby {}: player {} disconnected",
            self.code,
            self.roster.name_of(player)
        );

        let handled = match activity {
            ActivityKind::Lobby => self.activity.handle_disconnection(&mut self.roster, player),
            ActivityKind::Ship | ActivityKind::Minigame(_) => {
                let ship = self.ship.as_mut().ok_or_else(no_ship)?;
                ship.handle_disconnection(&mut self.roster, player)
            }
        };

        join_results([handled, self.after_turn()])
    }

    /// Runs timer work for the ship `id`. Work for a ship that has already ended is dropped.
    pub fn with_ship<F>(&mut self, id: ShipId, f: F) -> GameResult
    where
        F: FnOnce(&mut Ship, &mut Roster) -> GameResult,
    {
        let handled = match self.ship.as_mut() {
            Some(ship) if ship.id() == id => f(ship, &mut self.roster),
            _ => {
                warn!("lobby {}: dropping timer callback for ended {}", self.code, id);
                return Ok(());
            }
        };

        join_results([handled, self.after_turn()])
    }

    fn after_turn(&mut self) -> GameResult {
        let mut started = Ok(());

        if self.activity.start_requested {
            self.activity.start_requested = false;
            started = self.start_ship();
        }

        if self.ship.as_ref().map_or(false, Ship::is_finished) {
            info!("lobby {}: session over, back to staging", self.code);
            self.ship = None;
        }

        started
    }

    fn start_ship(&mut self) -> GameResult {
        if self.ship.is_some() {
            return Err(GameError::invariant(format!(
                "lobby {} starting a second ship",
                self.code
            )));
        }

        info!("lobby {}: starting game", self.code);

        // Ready states do not carry over into the next session.
        self.activity.ready.clear();

        let id = self.env.next_ship_id();
        let mut ship = Ship::new(id, self.code.clone(), Arc::clone(&self.env))?;
        let started = ship.start(&mut self.roster);

        self.ship = Some(ship);
        started
    }

    /// Stops the ship's own timers. Used when the lobby is torn down.
    pub fn shutdown(&mut self) {
        if let Some(ship) = self.ship.as_mut() {
            ship.shutdown();
        }
    }
}

fn no_ship() -> GameError {
    GameError::invariant("player is in a ship activity but the lobby has no ship")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::drain;
    use crate::client::Outbound;
    use crate::config::GameConfig;
    use crate::minigames::standard_registry;
    use crate::roster::tests::conn;
    use crate::timer::{Job, Scheduler};
    use tokio::sync::mpsc;

    fn lobby_with(config: GameConfig) -> (Lobby, mpsc::UnboundedReceiver<Job>) {
        let (scheduler, jobs) = Scheduler::new();
        let env = Arc::new(GameEnv::new(config, standard_registry(), scheduler));

        (Lobby::new(LobbyCode::new("4242"), env), jobs)
    }

    fn join(lobby: &mut Lobby, n: u32) -> (PlayerId, mpsc::Receiver<Outbound>) {
        let (c, mut rx) = conn(n);
        lobby.handle_join(c).unwrap();
        let id = lobby.player_for_client(ClientId(n)).unwrap();
        drain(&mut rx);
        (id, rx)
    }

    fn kinds(rx: &mut mpsc::Receiver<Outbound>) -> Vec<String> {
        drain(rx).iter().map(|m| m.kind().to_string()).collect()
    }

    #[tokio::test]
    async fn test_join_welcomes_and_notifies() {
        let (mut lobby, _jobs) = lobby_with(GameConfig::default());
        let (_, mut rx1) = join(&mut lobby, 1);

        let (c2, mut rx2) = conn(2);
        lobby.handle_join(c2).unwrap();

        let welcome = drain(&mut rx2);
        assert_eq!(welcome[0].kind(), "lobby_welcome");
        assert_eq!(welcome[0].get_str("lobby_id").unwrap(), "4242");
        assert_eq!(welcome[0].get_i64("your_team").unwrap(), 1);
        assert_eq!(welcome[0].get("peer_teams").unwrap().as_object().unwrap().len(), 1);

        assert_eq!(kinds(&mut rx1), vec!["lobby_peer_joined"]);
    }

    #[tokio::test]
    async fn test_full_lobby() {
        let (mut lobby, _jobs) = lobby_with(GameConfig::default());
        let _players: Vec<_> = (1..=6).map(|n| join(&mut lobby, n)).collect();

        let (c7, mut rx7) = conn(7);
        lobby.handle_join(c7).unwrap();

        assert_eq!(kinds(&mut rx7), vec!["lobby_full"]);
        assert_eq!(lobby.roster().len(), 6);
    }

    #[tokio::test]
    async fn test_ready_requires_even_teams() {
        let (mut lobby, _jobs) = lobby_with(GameConfig::default());
        let (a, mut rx_a) = join(&mut lobby, 1);

        lobby
            .handle_message(a, &Message::new("lobby_ready_change").with("ready", true))
            .unwrap();

        assert_eq!(kinds(&mut rx_a), vec!["lobby_ready_change_teams_not_ready_error"]);
        assert_eq!(lobby.activity().ready_count(), 0);
    }

    #[tokio::test]
    async fn test_team_change_clears_ready() {
        let (mut lobby, _jobs) = lobby_with(GameConfig::default());
        let (a, mut rx_a) = join(&mut lobby, 1);
        let (b, mut rx_b) = join(&mut lobby, 2);
        let (_c, _rx_c) = join(&mut lobby, 3);
        let (d, _rx_d) = join(&mut lobby, 4);
        drain(&mut rx_a);
        drain(&mut rx_b);

        lobby
            .handle_message(a, &Message::new("lobby_ready_change").with("ready", true))
            .unwrap();
        assert!(lobby.activity().is_player_ready(a));
        assert_eq!(kinds(&mut rx_b), vec!["lobby_peer_ready_change"]);

        lobby
            .handle_message(d, &Message::new("lobby_team_change").with("team", 0))
            .unwrap();

        assert_eq!(lobby.activity().ready_count(), 0);
        assert_eq!(lobby.roster().team(TeamIndex::Zero).len(), 3);

        let peer_change = drain(&mut rx_a);
        assert_eq!(peer_change[0].kind(), "lobby_peer_team_change");
        assert_eq!(peer_change[0].get_i64("team").unwrap(), 0);
        drain(&mut rx_b);

        lobby
            .handle_message(b, &Message::new("lobby_team_change").with("team", 7))
            .unwrap();
        assert_eq!(kinds(&mut rx_b), vec!["lobby_team_change_format_error"]);
    }

    #[tokio::test]
    async fn test_all_ready_starts_ship() {
        let (mut lobby, _jobs) = lobby_with(GameConfig::default());
        let (a, mut rx_a) = join(&mut lobby, 1);
        let (b, _rx_b) = join(&mut lobby, 2);

        let ready = Message::new("lobby_ready_change").with("ready", true);
        lobby.handle_message(a, &ready).unwrap();
        assert!(!lobby.in_game());

        lobby.handle_message(b, &ready).unwrap();

        assert!(lobby.in_game());
        assert_eq!(lobby.activity().ready_count(), 0);
        assert!(kinds(&mut rx_a).contains(&"ship_welcome".to_string()));

        let (c3, mut rx3) = conn(3);
        lobby.handle_join(c3).unwrap();
        assert_eq!(kinds(&mut rx3), vec!["lobby_in_game"]);
    }

    #[tokio::test]
    async fn test_strict_lobbies_need_full_teams() {
        let config = GameConfig {
            allow_smaller_lobbies: false,
            ..GameConfig::default()
        };
        let (mut lobby, _jobs) = lobby_with(config);
        let (a, mut rx_a) = join(&mut lobby, 1);
        let _b = join(&mut lobby, 2);

        lobby
            .handle_message(a, &Message::new("lobby_ready_change").with("ready", true))
            .unwrap();

        assert_eq!(kinds(&mut rx_a), vec!["lobby_ready_change_teams_not_ready_error"]);
    }

    #[tokio::test]
    async fn test_bye_and_unknown_type() {
        let (mut lobby, _jobs) = lobby_with(GameConfig::default());
        let (a, _rx_a) = join(&mut lobby, 1);
        let (b, mut rx_b) = join(&mut lobby, 2);

        lobby.handle_message(b, &Message::new("ship_flag_activate")).unwrap();
        let reply = drain(&mut rx_b);
        assert_eq!(reply[0].kind(), "lobby_unrecognised_message_type");
        assert_eq!(reply[0].get_str("bad_type").unwrap(), "ship_flag_activate");

        lobby.handle_message(a, &Message::new("lobby_bye")).unwrap();

        assert!(!lobby.roster().contains(a));
        assert_eq!(kinds(&mut rx_b), vec!["lobby_peer_left"]);
    }

    #[tokio::test]
    async fn test_stale_ship_callbacks_are_dropped() {
        let (mut lobby, _jobs) = lobby_with(GameConfig::default());

        let result = lobby.with_ship(ShipId(99), |_, _| {
            Err(GameError::invariant("must not run"))
        });

        assert!(result.is_ok());
    }
}
