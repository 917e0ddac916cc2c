//! Single-player whack-a-mole.
//!
//! Two moles are visible at a time, drawn from a per-game pool of locations. A hit moves
//! them and a miss window of [`REFRESH_INTERVAL`] moves them anyway. The flag remembers the
//! best score so far; only a strictly better score captures it.

use log::{debug, info, warn};
use rand::seq::SliceRandom;
use rand::Rng;
use std::time::Duration;

use crate::error::{GameError, GameResult};
use crate::minigame::{Minigame, MinigameContext, MinigamePrototype, MinigameResult, ScoreStore};
use crate::roster::PlayerId;
use crate::timer::Timer;
use shared::Message;

pub const GAME_TIME: Duration = Duration::from_secs(30);
pub const REFRESH_INTERVAL: Duration = Duration::from_millis(2500);

/// Number of distinct mole locations the client knows how to draw.
pub const LOCATION_COUNT: u32 = 33;
const LOCATIONS_PER_GAME: usize = 10;

const REFRESH: u32 = 0;
const GAME_OVER: u32 = 1;

pub const PROTOTYPE: MinigamePrototype = MinigamePrototype {
    name: "whack_a_mole",
    player_count: 1,
    worth: 1,
    cooldown: Duration::from_secs(5),
    store: Some(new_store),
    construct,
};

/// Best score reached on a flag.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BestScore(pub u32);

fn new_store() -> ScoreStore {
    Box::new(BestScore(0))
}

fn construct() -> Box<dyn Minigame> {
    Box::new(Moles {
        locations: Locations::random(&mut rand::thread_rng()),
        refresh_timer: Timer::expired(),
        game_timer: Timer::expired(),
        score: 0,
    })
}

/// The locations in play. The first two are the visible moles.
#[derive(Debug, Clone, PartialEq)]
struct Locations {
    pool: Vec<u32>,
}

impl Locations {
    fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let mut pool: Vec<u32> = (0..LOCATION_COUNT).collect();
        pool.shuffle(rng);
        pool.truncate(LOCATIONS_PER_GAME);

        Locations { pool }
    }

    /// Picks two new visible moles, never the two currently shown.
    fn refresh<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        let n = self.pool.len();

        self.pool.swap(0, n - 2);
        self.pool.swap(1, n - 1);
        self.pool[..n - 2].shuffle(rng);
    }

    fn selected(&self) -> [u32; 2] {
        [self.pool[0], self.pool[1]]
    }

    fn is_selected(&self, location: u32) -> bool {
        self.pool[..2].contains(&location)
    }
}

struct Moles {
    locations: Locations,
    refresh_timer: Timer,
    game_timer: Timer,
    score: u32,
}

impl Moles {
    fn restart_refresh(&mut self, ctx: &mut MinigameContext<'_>) -> GameResult {
        self.refresh_timer.stop();
        self.refresh_timer = ctx.schedule(REFRESH_INTERVAL, REFRESH)?;
        Ok(())
    }

    fn on_refresh(&mut self, ctx: &mut MinigameContext<'_>, player: PlayerId) -> GameResult {
        self.locations.refresh(&mut rand::thread_rng());
        self.restart_refresh(ctx)?;

        let msg = Message::new("mole_timeout").with("locations", self.locations.selected().to_vec());
        ctx.send(player, &msg)
    }

    fn hit(&mut self, ctx: &mut MinigameContext<'_>, player: PlayerId, message: &Message) -> GameResult {
        let location = match message.get_i64("location") {
            Ok(loc) if (0..i64::from(LOCATION_COUNT)).contains(&loc) => loc as u32,
            _ => {
                warn!("moles: {} sent an invalid location", ctx.name_of(player));
                return ctx.send(player, &Message::new("mole_invalid_location_error"));
            }
        };

        if !self.locations.is_selected(location) {
            // Usually a hit that crossed a refresh on the wire.
            debug!("moles: {} hit hidden location {}", ctx.name_of(player), location);
            return ctx.send(player, &Message::new("mole_location_not_selected_error"));
        }

        self.score += 1;
        self.locations.refresh(&mut rand::thread_rng());
        self.restart_refresh(ctx)?;

        let msg = Message::new("mole_hit_valid")
            .with("score", self.score)
            .with("new_moles", self.locations.selected().to_vec());

        ctx.send(player, &msg)
    }

    fn finish(&mut self, ctx: &mut MinigameContext<'_>, player: PlayerId) -> GameResult {
        let best = ctx.store_mut::<BestScore>()?;
        let won = self.score > best.0;

        if won {
            best.0 = self.score;
        }

        info!("moles: {} scored {} (won: {})", ctx.name_of(player), self.score, won);
        ctx.record_session(&[(player, f64::from(self.score), won)])?;

        let result = if won {
            MinigameResult::Win(ctx.team_of(player)?)
        } else {
            MinigameResult::Draw
        };

        self.end(ctx, result)
    }

    fn end(&mut self, ctx: &mut MinigameContext<'_>, result: MinigameResult) -> GameResult {
        self.refresh_timer.stop();
        self.game_timer.stop();

        ctx.end(result)
    }
}

impl Minigame for Moles {
    fn start(&mut self, ctx: &mut MinigameContext<'_>) -> GameResult {
        let player = ctx.exactly_one_player()?;
        let to_beat = ctx.store_mut::<BestScore>()?.0;

        let welcome = Message::new("mole_welcome")
            .with("duration_seconds", GAME_TIME.as_secs_f64())
            .with("interval_seconds", REFRESH_INTERVAL.as_secs_f64())
            .with("initial_moles", self.locations.selected().to_vec())
            .with("score_to_beat", to_beat);

        let sent = ctx.send(player, &welcome);

        self.refresh_timer = ctx.schedule(REFRESH_INTERVAL, REFRESH)?;
        self.game_timer = ctx.schedule(GAME_TIME, GAME_OVER)?;

        sent
    }

    fn handle(&mut self, ctx: &mut MinigameContext<'_>, player: PlayerId, message: &Message) -> GameResult {
        if message.kind() == "mole_hit" {
            return self.hit(ctx, player, message);
        }

        warn!("moles: unknown message {} from {}", message.kind(), ctx.name_of(player));

        let msg = Message::new("moles_unknown_message_type_error").with("bad_type", message.kind());
        ctx.send(player, &msg)
    }

    fn handle_disconnection(&mut self, ctx: &mut MinigameContext<'_>, player: PlayerId) -> GameResult {
        let result = ctx.disconnection(player)?;
        self.end(ctx, result)
    }

    fn handle_timer(&mut self, ctx: &mut MinigameContext<'_>, tag: u32) -> GameResult {
        let player = ctx.exactly_one_player()?;

        match tag {
            REFRESH => self.on_refresh(ctx, player),
            GAME_OVER => self.finish(ctx, player),
            other => Err(GameError::invariant(format!("moles has no timer {}", other))),
        }
    }
}
