//! Wire-level types shared between the game server and its tooling.
//!
//! Everything that travels over a WebSocket frame is a [`Message`]: a JSON object with a
//! mandatory `type` discriminator and free-form remaining fields. Map coordinates are
//! [`Position`] values. The constants below are the gameplay defaults the server starts
//! from when no override is configured.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub mod message;

pub use message::{Message, MessageError};

/// Maximum distance between a player and a flag they want to activate.
pub const FLAG_REACH: f64 = 50.0;
/// Length of the ship stage when nobody leaves early.
pub const SHIP_DURATION_SECS: u64 = 10 * 60;
/// Gap between `ship_tick` updates.
pub const SHIP_TICK_SECS: u64 = 5;
/// Gap between flag cooldown updates.
pub const COOLDOWN_TICK_SECS: u64 = 1;
/// Radius of the arc players are placed on when they come back from a minigame.
pub const RETURN_SPREAD: f64 = 20.0;
/// Largest number of players a lobby accepts.
pub const MAX_LOBBY_PLAYERS: usize = 6;
/// Players per team in a full-size game.
pub const FULL_TEAM_SIZE: usize = 3;
/// Gap between analytics position samples.
pub const RECORD_INTERVAL_MILLIS: u64 = 200;

/// Spawn rows for the two teams, ordered left, middle, right.
pub const TEAM_SPAWNS: [[Position; 3]; 2] = [
    [
        Position::new(-32.0, 416.0),
        Position::new(0.0, 416.0),
        Position::new(32.0, 416.0),
    ],
    [
        Position::new(-32.0, -400.0),
        Position::new(0.0, -400.0),
        Position::new(32.0, -400.0),
    ],
];

/// A point on the ship map.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Default)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Squared distance to `other`. Prefer this over [`Position::dist`] for comparisons.
    pub fn dist_sq(&self, other: Position) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;

        dx * dx + dy * dy
    }

    pub fn dist(&self, other: Position) -> f64 {
        self.dist_sq(other).sqrt()
    }

    /// Rotates this position by `angle` radians around (0, 0).
    pub fn rotate_about_origin(&self, angle: f64) -> Position {
        let (s, c) = angle.sin_cos();

        Position {
            x: self.x * c - self.y * s,
            y: self.x * s + self.y * c,
        }
    }

    /// Reads an `{"x": .., "y": ..}` object. Both fields must be numbers.
    pub fn from_value(value: &Value) -> Option<Position> {
        let obj = value.as_object()?;
        let x = obj.get("x")?.as_f64()?;
        let y = obj.get("y")?.as_f64()?;

        Some(Position { x, y })
    }

    pub fn to_value(&self) -> Value {
        json!({ "x": self.x, "y": self.y })
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

impl std::ops::Add for Position {
    type Output = Position;

    fn add(self, rhs: Position) -> Position {
        Position::new(self.x + rhs.x, self.y + rhs.y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use std::f64::consts::PI;

    #[test]
    fn test_dist_sq() {
        let a = Position::new(1.0, 2.0);
        let b = Position::new(4.0, 6.0);

        assert_eq!(a.dist_sq(b), 25.0);
        assert_eq!(a.dist(b), 5.0);
        assert_eq!(a.dist_sq(a), 0.0);
    }

    #[test]
    fn test_rotation() {
        let p = Position::new(0.0, -10.0);

        let quarter = p.rotate_about_origin(PI / 2.0);
        assert_approx_eq!(quarter.x, 10.0);
        assert_approx_eq!(quarter.y, 0.0);

        let half = p.rotate_about_origin(PI);
        assert_approx_eq!(half.x, 0.0);
        assert_approx_eq!(half.y, 10.0);
    }

    #[test]
    fn test_from_value() {
        let value = json!({ "x": 3.5, "y": -2 });
        assert_eq!(Position::from_value(&value), Some(Position::new(3.5, -2.0)));

        assert_eq!(Position::from_value(&json!({ "x": 1.0 })), None);
        assert_eq!(Position::from_value(&json!({ "x": "1", "y": 2.0 })), None);
        assert_eq!(Position::from_value(&json!([1.0, 2.0])), None);
    }

    #[test]
    fn test_value_round_trip() {
        let p = Position::new(-192.0, 208.0);
        assert_eq!(Position::from_value(&p.to_value()), Some(p));
    }

    #[test]
    fn test_spawn_rows_are_mirrored() {
        for i in 0..3 {
            assert_eq!(TEAM_SPAWNS[0][i].x, TEAM_SPAWNS[1][i].x);
        }

        assert!(TEAM_SPAWNS[0][0].y > 0.0);
        assert!(TEAM_SPAWNS[1][0].y < 0.0);
    }

    #[test]
    fn test_reach_is_positive() {
        assert!(FLAG_REACH > 0.0);
        assert!(MAX_LOBBY_PLAYERS >= 2 * FULL_TEAM_SIZE);
    }
}
