//! Game configuration threaded through the lobby manager, ships and minigames.

use shared::{
    Position, COOLDOWN_TICK_SECS, FLAG_REACH, MAX_LOBBY_PLAYERS, RECORD_INTERVAL_MILLIS,
    RETURN_SPREAD, SHIP_DURATION_SECS, SHIP_TICK_SECS, TEAM_SPAWNS,
};
use std::time::Duration;

/// Where a flag sits on the ship map and which minigame it gates.
#[derive(Debug, Clone, PartialEq)]
pub struct FlagPlacement {
    pub id: String,
    pub minigame: String,
    pub pos: Position,
}

impl FlagPlacement {
    pub fn new(id: &str, minigame: &str, x: f64, y: f64) -> Self {
        Self {
            id: id.to_string(),
            minigame: minigame.to_string(),
            pos: Position::new(x, y),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GameConfig {
    /// Time between entering the ship and the end screen.
    pub ship_duration: Duration,
    pub ship_tick_interval: Duration,
    pub cooldown_tick_interval: Duration,
    /// Maximum player-to-flag distance for activation.
    pub flag_reach: f64,
    pub return_spread: f64,
    pub max_lobby_players: usize,
    /// Allow any pair of equal, non-empty teams to start a game.
    pub allow_smaller_lobbies: bool,
    pub record_interval: Duration,
    pub team_spawns: [[Position; 3]; 2],
    pub layout: Vec<FlagPlacement>,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            ship_duration: Duration::from_secs(SHIP_DURATION_SECS),
            ship_tick_interval: Duration::from_secs(SHIP_TICK_SECS),
            cooldown_tick_interval: Duration::from_secs(COOLDOWN_TICK_SECS),
            flag_reach: FLAG_REACH,
            return_spread: RETURN_SPREAD,
            max_lobby_players: MAX_LOBBY_PLAYERS,
            allow_smaller_lobbies: true,
            record_interval: Duration::from_millis(RECORD_INTERVAL_MILLIS),
            team_spawns: TEAM_SPAWNS,
            layout: default_layout(),
        }
    }
}

impl GameConfig {
    pub fn flag_reach_sq(&self) -> f64 {
        self.flag_reach * self.flag_reach
    }
}

/// The standard nine-flag ship layout.
pub fn default_layout() -> Vec<FlagPlacement> {
    vec![
        FlagPlacement::new("flag0", "demo_minigame_2v2", 0.0, 0.0),
        FlagPlacement::new("flag1", "demo_minigame_1v1", -192.0, 208.0),
        FlagPlacement::new("flag2", "cps_race_sp", 192.0, 208.0),
        FlagPlacement::new("shush", "demo_minigame_sp", 192.0, 0.0),
        FlagPlacement::new("wam", "whack_a_mole", -192.0, 0.0),
        FlagPlacement::new("blah", "rps_1v1", 0.0, 256.0),
        FlagPlacement::new("dmspt", "demo_minigame_1v1", 0.0, -256.0),
        FlagPlacement::new("idfk", "cps_race_sp", 192.0, -208.0),
        FlagPlacement::new("idfk_", "cps_race_1v1", -192.0, -208.0),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_default_layout_ids_unique() {
        let layout = default_layout();
        let ids: HashSet<&str> = layout.iter().map(|f| f.id.as_str()).collect();

        assert_eq!(ids.len(), layout.len());
    }

    #[test]
    fn test_flags_do_not_overlap_reach() {
        let config = GameConfig::default();

        for a in &config.layout {
            for b in &config.layout {
                if a.id != b.id {
                    assert!(a.pos.dist_sq(b.pos) > config.flag_reach_sq());
                }
            }
        }
    }

    #[test]
    fn test_defaults() {
        let config = GameConfig::default();

        assert_eq!(config.ship_duration, Duration::from_secs(600));
        assert_eq!(config.flag_reach_sq(), 2500.0);
        assert!(config.allow_smaller_lobbies);
    }
}
