use std::collections::BTreeMap;

use crate::error::{join_results, GameResult};
use crate::roster::{PlayerId, Roster};
use shared::{Message, Position};

/// Tracks player positions for one activity and relays movement between its players.
///
/// Message types are namespaced by `prefix`, e.g. `ship_mov_position_update`.
#[derive(Debug, Clone)]
pub struct PositionManager {
    prefix: String,
    positions: BTreeMap<PlayerId, Position>,
}

impl PositionManager {
    pub fn new(prefix: &str) -> Self {
        PositionManager {
            prefix: prefix.to_string(),
            positions: BTreeMap::new(),
        }
    }

    fn kind(&self, suffix: &str) -> String {
        format!("{}{}", self.prefix, suffix)
    }

    pub fn get(&self, player: PlayerId) -> Option<Position> {
        self.positions.get(&player).copied()
    }

    /// Position of `player`, or the origin if none was ever set.
    pub fn get_or_default(&self, player: PlayerId) -> Position {
        self.get(player).unwrap_or_default()
    }

    pub fn set(&mut self, player: PlayerId, pos: Position) {
        self.positions.insert(player, pos);
    }

    pub fn remove(&mut self, player: PlayerId) -> Option<Position> {
        self.positions.remove(&player)
    }

    pub fn iter(&self) -> impl Iterator<Item = (PlayerId, Position)> + '_ {
        self.positions.iter().map(|(id, pos)| (*id, *pos))
    }

    /// Places a player and tells them and their activity peers.
    pub fn spawn(&mut self, roster: &Roster, player: PlayerId, pos: Position) -> GameResult {
        self.set(player, pos);

        let own = Message::new(self.kind("spawn"))
            .with("x", pos.x)
            .with("y", pos.y);

        let peer = Message::new(self.kind("peer_spawn"))
            .with("their_name", roster.name_of(player))
            .with("x", pos.x)
            .with("y", pos.y);

        join_results([
            roster.send(player, &own),
            roster.send_each(roster.activity_peers(player), &peer),
        ])
    }

    /// Handles `<prefix>position_update`. Returns `None` for any other message type so the
    /// caller can apply its own fallback.
    pub fn handle_message(
        &mut self,
        roster: &Roster,
        player: PlayerId,
        message: &Message,
    ) -> Option<GameResult> {
        let suffix = message.kind().strip_prefix(self.prefix.as_str())?;

        if suffix != "position_update" {
            return None;
        }

        Some(self.position_update(roster, player, message))
    }

    fn position_update(&mut self, roster: &Roster, player: PlayerId, message: &Message) -> GameResult {
        let x = match message.get_f64("x") {
            Ok(x) if x.is_finite() => x,
            _ => return roster.send(player, &Message::new(self.kind("position_update_bad_x_error"))),
        };

        let y = match message.get_f64("y") {
            Ok(y) if y.is_finite() => y,
            _ => return roster.send(player, &Message::new(self.kind("position_update_bad_y_error"))),
        };

        self.set(player, Position::new(x, y));

        let update = Message::new(self.kind("peer_position_update"))
            .with("their_name", roster.name_of(player))
            .with("x", x)
            .with("y", y);

        roster.send_each(roster.activity_peers(player), &update)
    }
}
