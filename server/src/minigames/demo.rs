//! Walk-to-the-line demo games.
//!
//! The single-player version is won the moment it starts. The team versions spawn everyone
//! at the origin and the first player to walk past the finish line wins for their team.

use log::{info, warn};
use std::time::Duration;

use crate::error::{join_results, GameResult};
use crate::minigame::{Minigame, MinigameContext, MinigamePrototype, MinigameResult};
use crate::movement::PositionManager;
use crate::roster::PlayerId;
use shared::{Message, Position};

/// X coordinate a player must pass to win.
pub const FINISH_LINE: f64 = 185.0;

pub const SINGLE_PLAYER: MinigamePrototype = MinigamePrototype {
    name: "demo_minigame_sp",
    player_count: 1,
    worth: 1,
    cooldown: Duration::from_secs(5),
    store: None,
    construct,
};

pub const ONE_VS_ONE: MinigamePrototype = MinigamePrototype {
    name: "demo_minigame_1v1",
    player_count: 2,
    worth: 2,
    cooldown: Duration::from_secs(10),
    store: None,
    construct,
};

pub const TWO_VS_TWO: MinigamePrototype = MinigamePrototype {
    name: "demo_minigame_2v2",
    player_count: 4,
    worth: 4,
    cooldown: Duration::from_secs(5),
    store: None,
    construct,
};

fn construct() -> Box<dyn Minigame> {
    Box::new(Demo {
        positions: PositionManager::new("demo_mov_"),
    })
}

struct Demo {
    positions: PositionManager,
}

impl Minigame for Demo {
    fn start(&mut self, ctx: &mut MinigameContext<'_>) -> GameResult {
        if ctx.proto().is_single_player() {
            let player = ctx.exactly_one_player()?;
            let team = ctx.team_of(player)?;

            return ctx.end(MinigameResult::Win(team));
        }

        let players = ctx.players()?;
        let roster = ctx.roster();

        join_results(
            players
                .into_iter()
                .map(|p| self.positions.spawn(roster, p, Position::default())),
        )
    }

    fn handle(&mut self, ctx: &mut MinigameContext<'_>, player: PlayerId, message: &Message) -> GameResult {
        let Some(moved) = self.positions.handle_message(ctx.roster(), player, message) else {
            warn!("demo: unknown message {} from {}", message.kind(), ctx.name_of(player));
            return ctx.send(player, &Message::new("demo_unknown_message_type_error"));
        };

        let crossed = self
            .positions
            .get(player)
            .map_or(false, |pos| pos.x > FINISH_LINE);

        if !crossed {
            return moved;
        }

        info!("demo: {} crossed the line", ctx.name_of(player));
        let team = ctx.team_of(player)?;

        join_results([moved, ctx.end(MinigameResult::Win(team))])
    }

    fn handle_disconnection(&mut self, ctx: &mut MinigameContext<'_>, player: PlayerId) -> GameResult {
        let result = ctx.disconnection(player)?;
        ctx.end(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::minigames::testing::Table;
    use crate::roster::TeamIndex;
    use crate::ship::FlagState;

    fn walk(x: f64) -> Message {
        Message::new("demo_mov_position_update").with("x", x).with("y", 0.0)
    }

    #[tokio::test]
    async fn test_single_player_wins_immediately() {
        let mut table = Table::new("demo_minigame_sp", 1);
        table.activate(1);

        let ship = table.ship().unwrap();
        assert_eq!(ship.flag_owner("flag"), Some(TeamIndex::One));
        assert_eq!(ship.flag_state("flag"), Some(FlagState::CoolingDown));
        assert_eq!(ship.score(table.player(1)), Some(1.0));
    }

    #[tokio::test]
    async fn test_first_across_the_line_wins() {
        let mut table = Table::new("demo_minigame_1v1", 1);
        table.activate(0);

        assert_eq!(table.ship().unwrap().flag_state("flag"), Some(FlagState::Running));
        assert!(table.kinds(0).contains(&"demo_mov_spawn".to_string()));
        assert!(table.kinds(1).contains(&"demo_mov_peer_spawn".to_string()));

        table.send(1, walk(100.0));
        assert_eq!(table.kinds(0), vec!["demo_mov_peer_position_update"]);

        table.send(1, walk(FINISH_LINE + 1.0));

        let ship = table.ship().unwrap();
        assert_eq!(ship.flag_owner("flag"), Some(TeamIndex::One));
        assert_eq!(ship.score(table.player(1)), Some(2.0));
        assert_eq!(ship.score(table.player(0)), Some(0.0));
        assert!(table.kinds(0).contains(&"ship_welcome_back".to_string()));
    }

    #[tokio::test]
    async fn test_unknown_message() {
        let mut table = Table::new("demo_minigame_1v1", 1);
        table.activate(0);
        table.messages(0);

        table.send(0, Message::new("demo_jump"));

        assert_eq!(table.kinds(0), vec!["demo_unknown_message_type_error"]);
        assert_eq!(table.ship().unwrap().flag_state("flag"), Some(FlagState::Running));
    }
}
