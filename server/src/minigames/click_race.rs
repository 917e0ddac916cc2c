//! Click races: click as often as possible before the clock runs out.
//!
//! Clients count their own clicks and report the total once they receive `cps_timeout`.
//! The single-player race must beat the flag's best total so far. The 1v1 race compares
//! team totals and ties are a draw.

use log::info;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::{GameError, GameResult};
use crate::minigame::{Minigame, MinigameContext, MinigamePrototype, MinigameResult, ScoreStore};
use crate::roster::PlayerId;
use crate::timer::Timer;
use shared::Message;

pub const RACE_TIME: Duration = Duration::from_secs(5);

const RACE_OVER: u32 = 0;

pub const SINGLE_PLAYER: MinigamePrototype = MinigamePrototype {
    name: "cps_race_sp",
    player_count: 1,
    worth: 1,
    cooldown: Duration::from_secs(5),
    store: Some(new_store),
    construct,
};

pub const ONE_VS_ONE: MinigamePrototype = MinigamePrototype {
    name: "cps_race_1v1",
    player_count: 2,
    worth: 1,
    cooldown: Duration::from_secs(10),
    store: None,
    construct,
};

/// Click total a single-player race has to beat on a flag.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ClicksToBeat(pub u32);

fn new_store() -> ScoreStore {
    Box::new(ClicksToBeat(0))
}

fn construct() -> Box<dyn Minigame> {
    Box::new(ClickRace::default())
}

#[derive(Debug, Default)]
struct ClickRace {
    reported: BTreeMap<PlayerId, u32>,
    timer: Timer,
}

impl ClickRace {
    fn report(&mut self, ctx: &mut MinigameContext<'_>, player: PlayerId, message: &Message) -> GameResult {
        if !self.timer.has_ended() {
            return ctx.send(player, &Message::new("cps_game_not_over_error"));
        }

        if self.reported.contains_key(&player) {
            return ctx.send(player, &Message::new("cps_report_player_has_score_error"));
        }

        let clicks = match message.get_i64("clicks").map(u32::try_from) {
            Ok(Ok(clicks)) => clicks,
            _ => return ctx.send(player, &Message::new("cps_report_bad_clicks_value_error")),
        };

        info!("cps: {} clicked {} times", ctx.name_of(player), clicks);
        self.reported.insert(player, clicks);

        if self.reported.len() < ctx.player_count() {
            return Ok(());
        }

        if ctx.proto().is_single_player() {
            self.finish_single(ctx, player)
        } else {
            self.finish_teams(ctx)
        }
    }

    fn finish_single(&mut self, ctx: &mut MinigameContext<'_>, player: PlayerId) -> GameResult {
        let clicks = self.reported.get(&player).copied().unwrap_or_default();

        let best = ctx.store_mut::<ClicksToBeat>()?;
        let won = clicks > best.0;
        if won {
            best.0 = clicks;
        }

        ctx.record_session(&[(player, f64::from(clicks), won)])?;

        let result = if won {
            MinigameResult::Win(ctx.team_of(player)?)
        } else {
            MinigameResult::Draw
        };

        ctx.end(result)
    }

    fn finish_teams(&mut self, ctx: &mut MinigameContext<'_>) -> GameResult {
        let mut totals = [0u32; 2];
        let mut teams = Vec::new();

        for (&player, &clicks) in &self.reported {
            let team = ctx.team_of(player)?;
            totals[team.index()] += clicks;
            teams.push((player, team));
        }

        let winner = match totals[0].cmp(&totals[1]) {
            std::cmp::Ordering::Equal => None,
            std::cmp::Ordering::Greater => Some(0),
            std::cmp::Ordering::Less => Some(1),
        };

        let results: Vec<(PlayerId, f64, bool)> = teams
            .iter()
            .map(|&(p, team)| (p, f64::from(totals[team.index()]), Some(team.index()) == winner))
            .collect();
        ctx.record_session(&results)?;

        let result = match winner.and_then(|w| teams.iter().find(|(_, t)| t.index() == w)) {
            Some(&(_, team)) => MinigameResult::Win(team),
            None => MinigameResult::Draw,
        };

        ctx.end(result)
    }
}

impl Minigame for ClickRace {
    fn start(&mut self, ctx: &mut MinigameContext<'_>) -> GameResult {
        let mut welcome = Message::new("cps_welcome").with("duration", RACE_TIME.as_secs_f64());

        if ctx.proto().is_single_player() {
            welcome.insert("score_to_beat", ctx.store_mut::<ClicksToBeat>()?.0);
        }

        let sent = ctx.broadcast(&welcome);
        self.timer = ctx.schedule(RACE_TIME, RACE_OVER)?;

        sent
    }

    fn handle(&mut self, ctx: &mut MinigameContext<'_>, player: PlayerId, message: &Message) -> GameResult {
        if message.kind() != "cps_report" {
            return ctx.send(player, &Message::new("cps_unknown_message_type_error"));
        }

        self.report(ctx, player, message)
    }

    fn handle_disconnection(&mut self, ctx: &mut MinigameContext<'_>, player: PlayerId) -> GameResult {
        self.timer.stop();

        let result = ctx.disconnection(player)?;
        ctx.end(result)
    }

    fn handle_timer(&mut self, ctx: &mut MinigameContext<'_>, tag: u32) -> GameResult {
        if tag != RACE_OVER {
            return Err(GameError::invariant(format!("click race has no timer {}", tag)));
        }

        ctx.broadcast(&Message::new("cps_timeout"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::minigames::testing::Table;
    use crate::roster::TeamIndex;
    use crate::ship::FlagState;

    fn clicks(n: i64) -> Message {
        Message::new("cps_report").with("clicks", n)
    }

    #[tokio::test(start_paused = true)]
    async fn test_report_rules() {
        let mut table = Table::new("cps_race_sp", 1);
        table.activate(0);

        let welcome = table.last_of(0, "cps_welcome").unwrap();
        assert_eq!(welcome.get_i64("score_to_beat").unwrap(), 0);

        table.send(0, clicks(3));
        table.send(0, Message::new("cps_click"));
        assert_eq!(
            table.kinds(0),
            vec!["cps_game_not_over_error", "cps_unknown_message_type_error"]
        );

        table.advance(RACE_TIME).await;
        assert_eq!(table.kinds(0), vec!["cps_timeout"]);

        table.send(0, clicks(-1));
        table.send(0, Message::new("cps_report").with("clicks", "lots"));
        assert_eq!(
            table.kinds(0),
            vec!["cps_report_bad_clicks_value_error", "cps_report_bad_clicks_value_error"]
        );

        table.send(0, clicks(9));
        assert_eq!(table.ship().unwrap().flag_owner("flag"), Some(TeamIndex::Zero));
    }

    #[tokio::test(start_paused = true)]
    async fn test_threshold_persists_between_plays() {
        let mut table = Table::new("cps_race_sp", 1);

        table.activate(0);
        table.advance(RACE_TIME).await;
        table.send(0, clicks(12));
        assert_eq!(table.ship().unwrap().flag_owner("flag"), Some(TeamIndex::Zero));

        table.advance(SINGLE_PLAYER.cooldown).await;
        table.messages(1);
        table.activate(1);

        let welcome = table.last_of(1, "cps_welcome").unwrap();
        assert_eq!(welcome.get_i64("score_to_beat").unwrap(), 12);

        table.advance(RACE_TIME).await;
        table.send(1, clicks(12));

        let ship = table.ship().unwrap();
        assert_eq!(ship.flag_owner("flag"), Some(TeamIndex::Zero));
        assert_eq!(ship.flag_state("flag"), Some(FlagState::CoolingDown));
        assert_eq!(ship.score(table.player(1)), Some(0.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_team_race() {
        let mut table = Table::new("cps_race_1v1", 1);
        table.activate(0);
        assert_eq!(table.ship().unwrap().flag_state("flag"), Some(FlagState::Running));

        table.advance(RACE_TIME).await;
        table.send(0, clicks(20));
        assert_eq!(table.ship().unwrap().flag_state("flag"), Some(FlagState::Running));

        table.send(0, clicks(20));
        assert_eq!(table.kinds(0).last().unwrap(), "cps_report_player_has_score_error");

        table.send(1, clicks(31));
        let ship = table.ship().unwrap();
        assert_eq!(ship.flag_owner("flag"), Some(TeamIndex::One));
        assert_eq!(ship.score(table.player(1)), Some(1.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_team_race_tie() {
        let mut table = Table::new("cps_race_1v1", 1);
        table.activate(0);

        table.advance(RACE_TIME).await;
        table.send(0, clicks(7));
        table.send(1, clicks(7));

        let ship = table.ship().unwrap();
        assert_eq!(ship.flag_owner("flag"), None);
        assert_eq!(ship.flag_state("flag"), Some(FlagState::CoolingDown));
        assert_eq!(ship.score(table.player(0)), Some(0.0));
        assert!(table.kinds(1).contains(&"ship_welcome_back".to_string()));
    }
}
