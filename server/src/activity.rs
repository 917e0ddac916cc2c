use crate::error::GameResult;
use crate::roster::{PlayerId, Roster};
use shared::Message;

/// The contract shared by the lobby, the ship and the minigame wrapper.
///
/// Implementations answer client mistakes with an error message and return `Ok`; an `Err`
/// means transport trouble or a broken invariant and is handled by the coordination loop.
pub trait Activity {
    /// Called once when the activity becomes current for its players.
    fn start(&mut self, roster: &mut Roster) -> GameResult;

    fn handle_message(&mut self, roster: &mut Roster, player: PlayerId, message: &Message)
        -> GameResult;

    /// Called when the player's connection is gone. Must leave no locks or timers behind
    /// that refer to the player.
    fn handle_disconnection(&mut self, roster: &mut Roster, player: PlayerId) -> GameResult;
}
