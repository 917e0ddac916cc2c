//! Rock-paper-scissors played until one player has won three rounds.
//!
//! Each round opens a selection window. When it closes the round is scored, both players
//! learn the outcome and their opponent's choice, and a short pause follows before the next
//! round. A player who made no selection loses the round unless the opponent also made none.

use log::{info, warn};
use std::time::Duration;

use crate::error::{join_results, GameError, GameResult};
use crate::minigame::{Minigame, MinigameContext, MinigamePrototype, MinigameResult};
use crate::roster::PlayerId;
use crate::timer::Timer;
use shared::Message;

pub const SELECTION_TIME: Duration = Duration::from_secs(3);
pub const POST_ROUND_TIME: Duration = Duration::from_secs(3);
pub const TARGET_WINS: u32 = 3;

const SELECTION_CLOSED: u32 = 0;
const NEXT_ROUND: u32 = 1;

pub const PROTOTYPE: MinigamePrototype = MinigamePrototype {
    name: "rps_1v1",
    player_count: 2,
    worth: 2,
    cooldown: Duration::from_secs(5),
    store: None,
    construct,
};

fn construct() -> Box<dyn Minigame> {
    Box::new(RockPaperScissors::default())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Element {
    Rock,
    Paper,
    Scissors,
}

impl Element {
    pub fn parse(name: &str) -> Option<Element> {
        match name {
            "rock" => Some(Element::Rock),
            "paper" => Some(Element::Paper),
            "scissors" => Some(Element::Scissors),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Element::Rock => "rock",
            Element::Paper => "paper",
            Element::Scissors => "scissors",
        }
    }

    pub fn beats(self, other: Element) -> bool {
        matches!(
            (self, other),
            (Element::Rock, Element::Scissors)
                | (Element::Scissors, Element::Paper)
                | (Element::Paper, Element::Rock)
        )
    }
}

/// Index of the round winner, or `None` for a draw.
fn round_winner(selections: [Option<Element>; 2]) -> Option<usize> {
    match selections {
        [a, b] if a == b => None,
        [Some(_), None] => Some(0),
        [None, Some(_)] => Some(1),
        [Some(a), Some(b)] => Some(if a.beats(b) { 0 } else { 1 }),
        [None, None] => None,
    }
}

#[derive(Debug, Default)]
struct RockPaperScissors {
    players: Vec<PlayerId>,
    selections: [Option<Element>; 2],
    wins: [u32; 2],
    selection_timer: Timer,
    post_round_timer: Timer,
}

impl RockPaperScissors {
    fn index_of(&self, player: PlayerId) -> GameResult<usize> {
        self.players
            .iter()
            .position(|&p| p == player)
            .ok_or_else(|| GameError::invariant(format!("{:?} is not playing rps", player)))
    }

    fn start_round(&mut self, ctx: &mut MinigameContext<'_>) -> GameResult {
        let announced = ctx.broadcast(&Message::new("rps_selection_start"));
        self.selection_timer = ctx.schedule(SELECTION_TIME, SELECTION_CLOSED)?;

        announced
    }

    fn end_round(&mut self, ctx: &mut MinigameContext<'_>) -> GameResult {
        let winner = round_winner(self.selections);

        if let Some(w) = winner {
            self.wins[w] += 1;
        }

        let reports = (0..2).map(|i| {
            let result = match winner {
                None => "draw",
                Some(w) if w == i => "win",
                Some(_) => "loss",
            };
            let opponent = self.selections[1 - i].map_or("none", Element::name);

            let msg = Message::new("rps_round_end")
                .with("result", result)
                .with("opponent_selection", opponent);

            (self.players[i], msg)
        });

        let sent = ctx.send_each(reports.collect::<Vec<_>>());

        self.selections = [None, None];
        self.post_round_timer = ctx.schedule(POST_ROUND_TIME, NEXT_ROUND)?;

        sent
    }

    fn after_round(&mut self, ctx: &mut MinigameContext<'_>) -> GameResult {
        match self.wins.iter().position(|&w| w >= TARGET_WINS) {
            Some(winner) => self.finish(ctx, winner),
            None => self.start_round(ctx),
        }
    }

    fn finish(&mut self, ctx: &mut MinigameContext<'_>, winner: usize) -> GameResult {
        let results: Vec<(PlayerId, f64, bool)> = (0..2)
            .map(|i| (self.players[i], f64::from(self.wins[i]), i == winner))
            .collect();
        ctx.record_session(&results)?;

        info!("rps: {} wins {:?}", ctx.name_of(self.players[winner]), self.wins);

        let team = ctx.team_of(self.players[winner])?;
        self.end(ctx, MinigameResult::Win(team))
    }

    fn end(&mut self, ctx: &mut MinigameContext<'_>, result: MinigameResult) -> GameResult {
        self.selection_timer.stop();
        self.post_round_timer.stop();

        ctx.end(result)
    }

    fn select(&mut self, ctx: &mut MinigameContext<'_>, player: PlayerId, message: &Message) -> GameResult {
        if self.selection_timer.has_ended() {
            return ctx.send(player, &Message::new("rps_selection_too_late_error"));
        }

        let i = self.index_of(player)?;

        if self.selections[i].is_some() {
            return ctx.send(player, &Message::new("rps_selection_already_made_error"));
        }

        let Ok(name) = message.get_str("element") else {
            warn!("rps: {} sent a selection without an element", ctx.name_of(player));
            return ctx.send(player, &Message::new("rps_selection_invalid_string_error"));
        };

        let Some(element) = Element::parse(name) else {
            warn!("rps: {} selected unknown element {}", ctx.name_of(player), name);
            return ctx.send(player, &Message::new("rps_invalid_selection_error"));
        };

        self.selections[i] = Some(element);
        Ok(())
    }
}

impl Minigame for RockPaperScissors {
    fn start(&mut self, ctx: &mut MinigameContext<'_>) -> GameResult {
        self.players = ctx.players()?;

        if self.players.len() != 2 {
            return Err(GameError::invariant(format!(
                "rps needs two players, got {}",
                self.players.len()
            )));
        }

        let welcome = Message::new("rps_welcome")
            .with("selection_secs", SELECTION_TIME.as_secs())
            .with("post_round_secs", POST_ROUND_TIME.as_secs())
            .with("target_win_count", TARGET_WINS);

        join_results([ctx.broadcast(&welcome), self.start_round(ctx)])
    }

    fn handle(&mut self, ctx: &mut MinigameContext<'_>, player: PlayerId, message: &Message) -> GameResult {
        if message.kind() != "rps_selection" {
            warn!("rps: unexpected message {} from {}", message.kind(), ctx.name_of(player));
            return ctx.send(player, &Message::new("rps_unexpected_message_type_error"));
        }

        self.select(ctx, player, message)
    }

    fn handle_disconnection(&mut self, ctx: &mut MinigameContext<'_>, player: PlayerId) -> GameResult {
        let result = ctx.disconnection(player)?;
        self.end(ctx, result)
    }

    fn handle_timer(&mut self, ctx: &mut MinigameContext<'_>, tag: u32) -> GameResult {
        match tag {
            SELECTION_CLOSED => self.end_round(ctx),
            NEXT_ROUND => self.after_round(ctx),
            other => Err(GameError::invariant(format!("rps has no timer {}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::minigames::testing::Table;
    use crate::roster::TeamIndex;
    use crate::ship::FlagState;

    fn pick(element: &str) -> Message {
        Message::new("rps_selection").with("element", element)
    }

    fn round_end(table: &mut Table, i: usize) -> (String, String) {
        let msg = table.last_of(i, "rps_round_end").unwrap();

        (
            msg.get_str("result").unwrap().to_string(),
            msg.get_str("opponent_selection").unwrap().to_string(),
        )
    }

    #[test]
    fn test_beats() {
        assert!(Element::Rock.beats(Element::Scissors));
        assert!(Element::Scissors.beats(Element::Paper));
        assert!(Element::Paper.beats(Element::Rock));
        assert!(!Element::Rock.beats(Element::Paper));
        assert!(!Element::Rock.beats(Element::Rock));
    }

    #[test]
    fn test_round_winner() {
        use Element::*;

        assert_eq!(round_winner([Some(Rock), Some(Rock)]), None);
        assert_eq!(round_winner([None, None]), None);
        assert_eq!(round_winner([Some(Paper), None]), Some(0));
        assert_eq!(round_winner([None, Some(Paper)]), Some(1));
        assert_eq!(round_winner([Some(Paper), Some(Scissors)]), Some(1));
        assert_eq!(round_winner([Some(Rock), Some(Scissors)]), Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_draw_round_then_next_round() {
        let mut table = Table::new("rps_1v1", 1);
        table.activate(0);

        let kinds = table.kinds(0);
        assert!(kinds.contains(&"rps_welcome".to_string()));
        assert!(kinds.contains(&"rps_selection_start".to_string()));

        table.send(0, pick("rock"));
        table.send(1, pick("rock"));
        table.advance(SELECTION_TIME).await;

        assert_eq!(round_end(&mut table, 0), ("draw".to_string(), "rock".to_string()));
        assert_eq!(round_end(&mut table, 1), ("draw".to_string(), "rock".to_string()));

        table.advance(POST_ROUND_TIME).await;
        assert_eq!(table.kinds(0), vec!["rps_selection_start"]);
        assert_eq!(table.ship().unwrap().flag_state("flag"), Some(FlagState::Running));
    }

    #[tokio::test(start_paused = true)]
    async fn test_selection_errors() {
        let mut table = Table::new("rps_1v1", 1);
        table.activate(0);
        table.messages(0);

        table.send(0, Message::new("rps_selection").with("element", 4));
        table.send(0, pick("lizard"));
        table.send(0, pick("paper"));
        table.send(0, pick("rock"));
        table.send(0, Message::new("rps_cheat"));

        assert_eq!(
            table.kinds(0),
            vec![
                "rps_selection_invalid_string_error",
                "rps_invalid_selection_error",
                "rps_selection_already_made_error",
                "rps_unexpected_message_type_error",
            ]
        );

        table.advance(SELECTION_TIME).await;
        table.messages(0);
        table.send(0, pick("rock"));
        assert_eq!(table.kinds(0), vec!["rps_selection_too_late_error"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_wins_take_the_flag() {
        let mut table = Table::new("rps_1v1", 1);
        table.activate(0);

        for round in 0..3 {
            table.send(1, pick("paper"));
            table.advance(SELECTION_TIME).await;
            assert_eq!(round_end(&mut table, 0), ("loss".to_string(), "paper".to_string()));
            assert_eq!(round_end(&mut table, 1), ("win".to_string(), "none".to_string()));

            table.advance(POST_ROUND_TIME).await;
            if round < 2 {
                assert_eq!(table.ship().unwrap().flag_state("flag"), Some(FlagState::Running));
            }
        }

        let ship = table.ship().unwrap();
        assert_eq!(ship.flag_owner("flag"), Some(TeamIndex::One));
        assert_eq!(ship.flag_state("flag"), Some(FlagState::CoolingDown));
        assert_eq!(ship.score(table.player(1)), Some(2.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_leaving_forfeits() {
        let mut table = Table::new("rps_1v1", 1);
        table.activate(0);

        table.disconnect(0);

        let end = table.last_of(1, "ship_game_end").unwrap();
        assert_eq!(end.get_i64("winning_team").unwrap(), 1);

        // Stopped timers never reach the ended context.
        table.advance(SELECTION_TIME + POST_ROUND_TIME).await;
    }
}
