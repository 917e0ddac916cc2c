//! The plug-in surface for minigames.
//!
//! A minigame kind is described by a [`MinigamePrototype`] and collected in a [`Registry`]
//! handed to the server at startup. Each running instance is a boxed [`Minigame`] that only
//! ever sees the ship through a [`MinigameContext`]: the context hands out participants, the
//! flag's persistent store and timers, and [`MinigameContext::end`] is the only way back to
//! the ship. Once a context has ended every further call on it is an invariant violation.

use log::warn;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::FlagPlacement;
use crate::error::{join_results, GameError, GameResult};
use crate::recorder::PlayerResult;
use crate::roster::{ActivityKind, ContextId, PlayerId, Roster, TeamIndex};
use crate::ship::Ship;
use crate::timer::Timer;
use shared::Message;

/// Persistent per-flag state, e.g. a score to beat.
pub type ScoreStore = Box<dyn Any + Send>;

/// Immutable description of one minigame kind.
#[derive(Clone)]
pub struct MinigamePrototype {
    pub name: &'static str,
    /// Total players across both teams; 1 for single-player games.
    pub player_count: usize,
    /// Tokens a team earns by owning the flag.
    pub worth: u32,
    pub cooldown: Duration,
    pub store: Option<fn() -> ScoreStore>,
    pub construct: fn() -> Box<dyn Minigame>,
}

impl MinigamePrototype {
    pub fn team_size(&self) -> usize {
        self.player_count / 2
    }

    pub fn is_single_player(&self) -> bool {
        self.player_count == 1
    }

    /// Share of the worth credited to each winning participant.
    pub fn individual_worth(&self) -> f64 {
        if self.is_single_player() {
            return f64::from(self.worth);
        }

        f64::from(self.worth) / self.team_size() as f64
    }
}

impl fmt::Debug for MinigamePrototype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MinigamePrototype")
            .field("name", &self.name)
            .field("player_count", &self.player_count)
            .field("worth", &self.worth)
            .field("cooldown", &self.cooldown)
            .finish()
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum LayoutError {
    #[error("layout has no flags")]
    Empty,

    #[error("flag id '{0}' is used twice")]
    DuplicateFlag(String),

    #[error("flag '{flag}' refers to unknown minigame '{minigame}'")]
    UnknownMinigame { flag: String, minigame: String },

    #[error("minigame '{0}' must be single-player or have an even player count")]
    BadPlayerCount(String),
}

/// Maps minigame names to prototypes.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    protos: HashMap<&'static str, Arc<MinigamePrototype>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    pub fn with(mut self, proto: MinigamePrototype) -> Self {
        self.register(proto);
        self
    }

    pub fn register(&mut self, proto: MinigamePrototype) {
        if self.protos.insert(proto.name, Arc::new(proto)).is_some() {
            warn!("minigame registered twice; keeping the later prototype");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<MinigamePrototype>> {
        self.protos.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.protos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.protos.is_empty()
    }

    /// Checks a flag layout against this registry before any ship uses it.
    pub fn validate_layout(&self, layout: &[FlagPlacement]) -> Result<(), LayoutError> {
        if layout.is_empty() {
            return Err(LayoutError::Empty);
        }

        let mut seen = HashSet::new();

        for placement in layout {
            if !seen.insert(placement.id.as_str()) {
                return Err(LayoutError::DuplicateFlag(placement.id.clone()));
            }

            let proto = self
                .get(&placement.minigame)
                .ok_or_else(|| LayoutError::UnknownMinigame {
                    flag: placement.id.clone(),
                    minigame: placement.minigame.clone(),
                })?;

            let count = proto.player_count;
            if count == 0 || (count > 1 && count % 2 != 0) {
                return Err(LayoutError::BadPlayerCount(proto.name.to_string()));
            }
        }

        Ok(())
    }
}

/// How a minigame instance finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MinigameResult {
    Win(TeamIndex),
    /// No team wins. Also used for a single-player loss.
    Draw,
    /// A participant left. In team games the other team is awarded the win.
    Disconnected {
        player: PlayerId,
        winner: Option<TeamIndex>,
    },
}

impl MinigameResult {
    pub fn winner(&self) -> Option<TeamIndex> {
        match *self {
            MinigameResult::Win(team) => Some(team),
            MinigameResult::Draw => None,
            MinigameResult::Disconnected { winner, .. } => winner,
        }
    }

    pub fn disconnected(&self) -> Option<PlayerId> {
        match *self {
            MinigameResult::Disconnected { player, .. } => Some(player),
            _ => None,
        }
    }
}

/// One running minigame instance.
pub trait Minigame: Send {
    fn start(&mut self, ctx: &mut MinigameContext<'_>) -> GameResult;

    fn handle(&mut self, ctx: &mut MinigameContext<'_>, player: PlayerId, message: &Message)
        -> GameResult;

    /// Must end the minigame, normally with [`MinigameContext::disconnection`].
    fn handle_disconnection(&mut self, ctx: &mut MinigameContext<'_>, player: PlayerId)
        -> GameResult;

    /// Called when a timer created with [`MinigameContext::schedule`] fires.
    fn handle_timer(&mut self, ctx: &mut MinigameContext<'_>, tag: u32) -> GameResult {
        let _ = (ctx, tag);
        Ok(())
    }
}

/// Capability handle a minigame uses to reach its participants and the ship.
pub struct MinigameContext<'a> {
    pub(crate) ship: &'a mut Ship,
    pub(crate) roster: &'a mut Roster,
    pub(crate) id: ContextId,
    pub(crate) flag: usize,
    pub(crate) ended: bool,
}

impl<'a> MinigameContext<'a> {
    fn ensure_valid(&self) -> GameResult {
        if self.ended {
            return Err(GameError::invariant(format!(
                "minigame context {:?} used after it ended",
                self.id
            )));
        }

        Ok(())
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn has_ended(&self) -> bool {
        self.ended
    }

    pub fn proto(&self) -> Arc<MinigamePrototype> {
        Arc::clone(&self.ship.flags[self.flag].proto)
    }

    pub fn player_count(&self) -> usize {
        self.ship.flags[self.flag].proto.player_count
    }

    pub fn roster(&self) -> &Roster {
        self.roster
    }

    /// Participants: players whose current activity is this minigame, in id order.
    pub fn players(&self) -> GameResult<Vec<PlayerId>> {
        self.ensure_valid()?;
        Ok(self.roster.in_activity(ActivityKind::Minigame(self.id)))
    }

    /// The sole participant of a single-player minigame.
    pub fn exactly_one_player(&self) -> GameResult<PlayerId> {
        let players = self.players()?;

        match players.as_slice() {
            [one] => Ok(*one),
            _ => Err(GameError::invariant(format!(
                "expected exactly one player in {}, found {}",
                self.proto().name,
                players.len()
            ))),
        }
    }

    pub fn team_of(&self, player: PlayerId) -> GameResult<TeamIndex> {
        Ok(self.roster.player(player)?.team)
    }

    pub fn name_of(&self, player: PlayerId) -> String {
        self.roster.name_of(player)
    }

    pub fn send(&self, player: PlayerId, message: &Message) -> GameResult {
        self.ensure_valid()?;
        self.roster.send(player, message)
    }

    /// Sends to every participant.
    pub fn broadcast(&self, message: &Message) -> GameResult {
        let players = self.players()?;
        self.roster.send_each(players, message)
    }

    /// The flag's persistent store, downcast to the minigame's own type.
    pub fn store_mut<T: Any>(&mut self) -> GameResult<&mut T> {
        self.ensure_valid()?;
        let name = self.ship.flags[self.flag].proto.name;

        self.ship.flags[self.flag]
            .store
            .as_mut()
            .and_then(|store| store.downcast_mut::<T>())
            .ok_or_else(|| GameError::invariant(format!("{} has no store of the expected type", name)))
    }

    /// Starts a one-shot timer that calls [`Minigame::handle_timer`] with `tag`.
    ///
    /// Timers still pending when the minigame ends are stopped with it.
    pub fn schedule(&mut self, delay: Duration, tag: u32) -> GameResult<Timer> {
        self.ensure_valid()?;
        Ok(self.ship.minigame_timer(self.id, delay, tag))
    }

    /// The result for `player` leaving: the other team wins, or nobody in single-player games.
    pub fn disconnection(&self, player: PlayerId) -> GameResult<MinigameResult> {
        let winner = if self.ship.flags[self.flag].proto.is_single_player() {
            None
        } else {
            Some(self.team_of(player)?.opposing())
        };

        Ok(MinigameResult::Disconnected { player, winner })
    }

    pub fn recording(&self) -> bool {
        self.ship.recorder.is_some()
    }

    /// Reports per-player results for analytics. A no-op unless recording is enabled.
    pub fn record_session(&mut self, results: &[(PlayerId, f64, bool)]) -> GameResult {
        self.ensure_valid()?;

        let results: Vec<PlayerResult> = results
            .iter()
            .filter_map(|&(id, score, won)| {
                self.roster.get(id).map(|p| PlayerResult {
                    name: p.name.clone(),
                    team: p.team.index(),
                    score,
                    won,
                })
            })
            .collect();

        self.ship.record_minigame_session(self.flag, results);
        Ok(())
    }

    /// Hands the result to the ship, which returns the participants and invalidates this
    /// context.
    pub fn end(&mut self, result: MinigameResult) -> GameResult {
        self.ensure_valid()?;
        self.ended = true;

        self.ship.end_minigame(self.roster, self.id, result)
    }

    /// Sends to each participant in turn, then reports every failure together.
    pub fn send_each<I>(&self, messages: I) -> GameResult
    where
        I: IntoIterator<Item = (PlayerId, Message)>,
    {
        self.ensure_valid()?;
        join_results(
            messages
                .into_iter()
                .map(|(player, message)| self.roster.send(player, &message)),
        )
    }
}
