//! Players and teams of one lobby.
//!
//! The roster is the arena every activity works against: players are addressed by
//! [`PlayerId`], teams by [`TeamIndex`], and each player's [`ActivityKind`] is the single
//! source of truth for which activity receives their messages.

use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::client::{ClientId, Connection};
use crate::error::{join_results, GameError, GameResult};
use shared::Message;

/// Unique within one lobby's roster. Ids of removed players are never handed out again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlayerId(pub u32);

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

/// Identifies one running minigame instance within a ship.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TeamIndex {
    Zero,
    One,
}

impl TeamIndex {
    pub const BOTH: [TeamIndex; 2] = [TeamIndex::Zero, TeamIndex::One];

    pub fn index(self) -> usize {
        match self {
            TeamIndex::Zero => 0,
            TeamIndex::One => 1,
        }
    }

    pub fn opposing(self) -> TeamIndex {
        match self {
            TeamIndex::Zero => TeamIndex::One,
            TeamIndex::One => TeamIndex::Zero,
        }
    }

    pub fn from_number(n: i64) -> Option<TeamIndex> {
        match n {
            0 => Some(TeamIndex::Zero),
            1 => Some(TeamIndex::One),
            _ => None,
        }
    }
}

impl From<TeamIndex> for Value {
    fn from(team: TeamIndex) -> Value {
        Value::from(team.index())
    }
}

/// Which activity currently owns a player.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityKind {
    Lobby,
    Ship,
    Minigame(ContextId),
}

#[derive(Debug, Clone)]
pub struct Player {
    pub id: PlayerId,
    pub name: String,
    pub team: TeamIndex,
    pub conn: Connection,
    pub activity: ActivityKind,
}

impl Player {
    pub fn client(&self) -> ClientId {
        self.conn.id
    }
}

#[derive(Debug, Clone)]
pub struct Team {
    pub index: TeamIndex,
    pub members: BTreeSet<PlayerId>,
}

impl Team {
    fn new(index: TeamIndex) -> Self {
        Team {
            index,
            members: BTreeSet::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[derive(Debug)]
pub struct Roster {
    teams: [Team; 2],
    players: BTreeMap<PlayerId, Player>,
    next_player: u32,
}

impl Default for Roster {
    fn default() -> Self {
        Roster::new()
    }
}

impl Roster {
    pub fn new() -> Self {
        Roster {
            teams: [Team::new(TeamIndex::Zero), Team::new(TeamIndex::One)],
            players: BTreeMap::new(),
            next_player: 1,
        }
    }

    /// Adds a player to the smaller team (team zero on a tie) in the lobby activity.
    pub fn add_player(&mut self, name: String, conn: Connection) -> PlayerId {
        let id = PlayerId(self.next_player);
        self.next_player += 1;

        let team = if self.teams[0].len() <= self.teams[1].len() {
            TeamIndex::Zero
        } else {
            TeamIndex::One
        };

        self.teams[team.index()].members.insert(id);
        self.players.insert(
            id,
            Player {
                id,
                name,
                team,
                conn,
                activity: ActivityKind::Lobby,
            },
        );

        id
    }

    /// Removes the player from their team and the lobby. Their connection link goes with them.
    pub fn remove(&mut self, id: PlayerId) -> GameResult<Player> {
        let player = self
            .players
            .remove(&id)
            .ok_or_else(|| GameError::invariant(format!("removing unknown player {}", id)))?;

        if !self.teams[player.team.index()].members.remove(&id) {
            return Err(GameError::invariant(format!(
                "player {} missing from team {}",
                player.name,
                player.team.index()
            )));
        }

        Ok(player)
    }

    pub fn switch_team(&mut self, id: PlayerId, team: TeamIndex) -> GameResult {
        let player = self.player_mut(id)?;

        if player.activity != ActivityKind::Lobby {
            return Err(GameError::invariant(format!(
                "team change for {} outside the lobby activity",
                player.name
            )));
        }

        let old = player.team;
        player.team = team;

        self.teams[old.index()].members.remove(&id);
        self.teams[team.index()].members.insert(id);

        Ok(())
    }

    pub fn get(&self, id: PlayerId) -> Option<&Player> {
        self.players.get(&id)
    }

    pub fn player(&self, id: PlayerId) -> GameResult<&Player> {
        self.players
            .get(&id)
            .ok_or_else(|| GameError::invariant(format!("unknown player {}", id)))
    }

    pub fn player_mut(&mut self, id: PlayerId) -> GameResult<&mut Player> {
        self.players
            .get_mut(&id)
            .ok_or_else(|| GameError::invariant(format!("unknown player {}", id)))
    }

    pub fn contains(&self, id: PlayerId) -> bool {
        self.players.contains_key(&id)
    }

    pub fn name_of(&self, id: PlayerId) -> String {
        self.players
            .get(&id)
            .map(|p| p.name.clone())
            .unwrap_or_else(|| id.to_string())
    }

    pub fn find_by_name(&self, name: &str) -> Option<PlayerId> {
        self.players.values().find(|p| p.name == name).map(|p| p.id)
    }

    pub fn is_name_taken(&self, name: &str) -> bool {
        self.players.values().any(|p| p.name == name)
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    pub fn team(&self, index: TeamIndex) -> &Team {
        &self.teams[index.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Player> {
        self.players.values()
    }

    pub fn ids(&self) -> Vec<PlayerId> {
        self.players.keys().copied().collect()
    }

    pub fn clients(&self) -> Vec<ClientId> {
        self.players.values().map(Player::client).collect()
    }

    /// Players whose current activity is `activity`, in id order.
    pub fn in_activity(&self, activity: ActivityKind) -> Vec<PlayerId> {
        self.players
            .values()
            .filter(|p| p.activity == activity)
            .map(|p| p.id)
            .collect()
    }

    /// Other players sharing `id`'s current activity.
    pub fn activity_peers(&self, id: PlayerId) -> Vec<PlayerId> {
        match self.players.get(&id) {
            Some(player) => self
                .in_activity(player.activity)
                .into_iter()
                .filter(|&p| p != id)
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn set_activity(&mut self, id: PlayerId, activity: ActivityKind) -> GameResult {
        self.player_mut(id)?.activity = activity;
        Ok(())
    }

    pub fn set_all_activities(&mut self, activity: ActivityKind) {
        for player in self.players.values_mut() {
            player.activity = activity;
        }
    }

    pub fn send(&self, id: PlayerId, message: &Message) -> GameResult {
        self.player(id)?.conn.send(message)
    }

    /// Sends to every listed player, collecting failures instead of stopping at the first.
    pub fn send_each<I>(&self, ids: I, message: &Message) -> GameResult
    where
        I: IntoIterator<Item = PlayerId>,
    {
        join_results(ids.into_iter().map(|id| self.send(id, message)))
    }

    pub fn broadcast(&self, message: &Message) -> GameResult {
        join_results(self.players.values().map(|p| p.conn.send(message)))
    }

    /// A `{name: team}` object of everyone except `except`.
    pub fn team_map(&self, except: Option<PlayerId>) -> Value {
        let map: Map<String, Value> = self
            .players
            .values()
            .filter(|p| Some(p.id) != except)
            .map(|p| (p.name.clone(), Value::from(p.team)))
            .collect();

        Value::Object(map)
    }

    /// Verifies every player sits in exactly the team their record names.
    pub fn check_membership(&self) -> GameResult {
        for player in self.players.values() {
            let own = &self.teams[player.team.index()];
            let other = &self.teams[player.team.opposing().index()];

            if !own.members.contains(&player.id) || other.members.contains(&player.id) {
                return Err(GameError::invariant(format!(
                    "player {} has inconsistent team membership",
                    player.name
                )));
            }
        }

        let total = self.teams[0].len() + self.teams[1].len();
        if total != self.players.len() {
            return Err(GameError::invariant("team members without player records"));
        }

        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::client::tests::{drain, test_addr};
    use crate::client::Outbound;
    use tokio::sync::mpsc;

    pub(crate) fn conn(n: u32) -> (Connection, mpsc::Receiver<Outbound>) {
        Connection::channel(ClientId(n), test_addr())
    }

    #[test]
    fn test_team_balancing() {
        let mut roster = Roster::new();

        let a = roster.add_player("A".into(), conn(1).0);
        let b = roster.add_player("B".into(), conn(2).0);
        let c = roster.add_player("C".into(), conn(3).0);

        assert_eq!(roster.player(a).unwrap().team, TeamIndex::Zero);
        assert_eq!(roster.player(b).unwrap().team, TeamIndex::One);
        assert_eq!(roster.player(c).unwrap().team, TeamIndex::Zero);
        assert!(roster.check_membership().is_ok());
    }

    #[test]
    fn test_ids_are_per_roster_and_not_reused() {
        let mut first = Roster::new();
        let mut second = Roster::new();

        let a = first.add_player("A".into(), conn(1).0);
        let b = second.add_player("B".into(), conn(2).0);
        assert_eq!(a, PlayerId(1));
        assert_eq!(b, PlayerId(1));

        first.remove(a).unwrap();
        let c = first.add_player("C".into(), conn(3).0);
        assert_eq!(c, PlayerId(2));
    }

    #[test]
    fn test_switch_and_remove() {
        let mut roster = Roster::new();
        let a = roster.add_player("A".into(), conn(1).0);

        roster.switch_team(a, TeamIndex::One).unwrap();
        assert_eq!(roster.team(TeamIndex::One).len(), 1);
        assert!(roster.team(TeamIndex::Zero).is_empty());

        let removed = roster.remove(a).unwrap();
        assert_eq!(removed.name, "A");
        assert!(roster.is_empty());
        assert!(roster.remove(a).unwrap_err().is_invariant());
    }

    #[test]
    fn test_switch_outside_lobby_is_invariant() {
        let mut roster = Roster::new();
        let a = roster.add_player("A".into(), conn(1).0);
        roster.set_activity(a, ActivityKind::Ship).unwrap();

        assert!(roster.switch_team(a, TeamIndex::One).unwrap_err().is_invariant());
    }

    #[test]
    fn test_activity_peers() {
        let mut roster = Roster::new();
        let a = roster.add_player("A".into(), conn(1).0);
        let b = roster.add_player("B".into(), conn(2).0);
        let c = roster.add_player("C".into(), conn(3).0);

        roster.set_all_activities(ActivityKind::Ship);
        roster
            .set_activity(c, ActivityKind::Minigame(ContextId(1)))
            .unwrap();

        assert_eq!(roster.activity_peers(a), vec![b]);
        assert!(roster.activity_peers(c).is_empty());
        assert_eq!(roster.in_activity(ActivityKind::Ship), vec![a, b]);
    }

    #[test]
    fn test_broadcast_continues_past_failures() {
        let mut roster = Roster::new();
        let (c1, rx1) = conn(1);
        let (c2, mut rx2) = conn(2);
        roster.add_player("A".into(), c1);
        roster.add_player("B".into(), c2);
        drop(rx1);

        let result = roster.broadcast(&Message::new("ship_endgame"));

        assert!(matches!(result, Err(GameError::ConnectionClosed(ClientId(1)))));
        assert_eq!(drain(&mut rx2).len(), 1);
    }

    #[test]
    fn test_team_map_and_names() {
        let mut roster = Roster::new();
        let a = roster.add_player("A".into(), conn(1).0);
        roster.add_player("B".into(), conn(2).0);

        let map = roster.team_map(Some(a));
        assert_eq!(map, serde_json::json!({ "B": 1 }));
        assert!(roster.is_name_taken("A"));
        assert_eq!(roster.find_by_name("B").map(|id| roster.name_of(id)), Some("B".into()));
    }

    #[test]
    fn test_opposing_team() {
        assert_eq!(TeamIndex::Zero.opposing(), TeamIndex::One);
        assert_eq!(TeamIndex::from_number(1), Some(TeamIndex::One));
        assert_eq!(TeamIndex::from_number(2), None);
    }
}
