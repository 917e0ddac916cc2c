//! The ship: the hub activity between the lobby and the minigames.
//!
//! Each flag cycles through idle, activating (recruiting players), running (a minigame is
//! in progress) and cooling down. A player may be locked to one flag at a time; whenever a
//! lock is added the ship tries to fill the recruiting flags from the free players, oldest
//! activation first, choosing randomly among candidates for each open slot.
//!
//! The session ends through the endgame: it starts when the countdown runs out or when any
//! player leaves, stops every timer and recruitment, and finishes the session as soon as no
//! minigame is running anymore.

use log::{debug, info, warn};
use rand::seq::SliceRandom;
use serde_json::{json, Map, Value};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::f64::consts::PI;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::activity::Activity;
use crate::config::FlagPlacement;
use crate::error::{join_results, GameError, GameResult};
use crate::lobby::LobbyCode;
use crate::lobby_manager::{GameEnv, LobbyManager};
use crate::minigame::{Minigame, MinigameContext, MinigamePrototype, MinigameResult, ScoreStore};
use crate::movement::PositionManager;
use crate::recorder::{MinigameSession, PlayerResult, Recorder};
use crate::roster::{ActivityKind, ContextId, PlayerId, Roster, TeamIndex};
use crate::timer::{Job, StopHandle, TickFn, Timer};
use crate::utils::unix_millis;
use shared::{Message, Position};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShipId(pub u64);

impl fmt::Display for ShipId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ship{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagState {
    Idle,
    Activating,
    Running,
    CoolingDown,
}

#[derive(Debug)]
pub(crate) struct Activation {
    started: Instant,
    locked: BTreeSet<PlayerId>,
}

pub(crate) struct MinigameSlot {
    id: ContextId,
    /// Taken out while the minigame is being called.
    imp: Option<Box<dyn Minigame>>,
    started: bool,
    began: Instant,
    /// Timers the minigame scheduled; stopped when the slot is torn down.
    timers: Vec<StopHandle>,
}

impl MinigameSlot {
    fn stop_timers(&mut self) {
        for timer in self.timers.drain(..) {
            timer.stop();
        }
    }
}

pub(crate) struct Flag {
    pub(crate) id: String,
    pub(crate) pos: Position,
    pub(crate) proto: Arc<MinigamePrototype>,
    pub(crate) store: Option<ScoreStore>,
    pub(crate) owner: Option<TeamIndex>,
    pub(crate) cooldown: Timer,
    pub(crate) activation: Option<Activation>,
    pub(crate) minigame: Option<MinigameSlot>,
}

impl Flag {
    fn new(placement: &FlagPlacement, proto: Arc<MinigamePrototype>) -> Self {
        let store = proto.store.map(|make| make());

        Flag {
            id: placement.id.clone(),
            pos: placement.pos,
            proto,
            store,
            owner: None,
            cooldown: Timer::expired(),
            activation: None,
            minigame: None,
        }
    }

    fn state(&self) -> FlagState {
        if self.minigame.is_some() {
            FlagState::Running
        } else if self.activation.is_some() {
            FlagState::Activating
        } else if !self.cooldown.has_ended() {
            FlagState::CoolingDown
        } else {
            FlagState::Idle
        }
    }

    fn is_locked(&self, player: PlayerId) -> bool {
        self.activation
            .as_ref()
            .map_or(false, |a| a.locked.contains(&player))
    }

    /// True if the flag is recruiting and the player's team still has an open slot.
    fn needs_player(&self, roster: &Roster, player: PlayerId) -> bool {
        let (Some(activation), Some(team)) = (&self.activation, roster.get(player).map(|p| p.team))
        else {
            return false;
        };

        let same_team = activation
            .locked
            .iter()
            .filter(|&&p| roster.get(p).map(|pl| pl.team) == Some(team))
            .count();

        same_team < self.proto.team_size()
    }

    fn has_all_players(&self) -> bool {
        self.activation
            .as_ref()
            .map_or(false, |a| a.locked.len() == self.proto.player_count)
    }
}

fn pos_map<I>(roster: &Roster, entries: I) -> Value
where
    I: IntoIterator<Item = (PlayerId, Position)>,
{
    let map: Map<String, Value> = entries
        .into_iter()
        .map(|(id, pos)| (roster.name_of(id), pos.to_value()))
        .collect();

    Value::Object(map)
}

fn names(roster: &Roster, ids: impl IntoIterator<Item = PlayerId>) -> Vec<String> {
    ids.into_iter().map(|id| roster.name_of(id)).collect()
}

pub struct Ship {
    id: ShipId,
    lobby: LobbyCode,
    env: Arc<GameEnv>,
    pub(crate) flags: Vec<Flag>,
    positions: PositionManager,
    scores: BTreeMap<PlayerId, f64>,
    countdown: Timer,
    endgame: bool,
    finished: bool,
    /// Team awarded the session when a player leaves before the endgame.
    forfeit: Option<TeamIndex>,
    next_context: u64,
    pub(crate) recorder: Option<Recorder>,
}

impl Ship {
    /// Builds the flags from the configured layout.
    pub fn new(id: ShipId, lobby: LobbyCode, env: Arc<GameEnv>) -> GameResult<Self> {
        let flags = env
            .config
            .layout
            .iter()
            .map(|placement| {
                env.registry
                    .get(&placement.minigame)
                    .map(|proto| Flag::new(placement, proto))
                    .ok_or_else(|| {
                        GameError::invariant(format!(
                            "flag {} uses unregistered minigame {}",
                            placement.id, placement.minigame
                        ))
                    })
            })
            .collect::<GameResult<Vec<_>>>()?;

        Ok(Ship {
            id,
            lobby,
            env,
            flags,
            positions: PositionManager::new("ship_mov_"),
            scores: BTreeMap::new(),
            countdown: Timer::expired(),
            endgame: false,
            finished: false,
            forfeit: None,
            next_context: 0,
            recorder: None,
        })
    }

    pub fn id(&self) -> ShipId {
        self.id
    }

    pub fn lobby_code(&self) -> &LobbyCode {
        &self.lobby
    }

    pub fn is_endgame(&self) -> bool {
        self.endgame
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn is_recording(&self) -> bool {
        self.recorder.is_some()
    }

    pub fn score(&self, player: PlayerId) -> Option<f64> {
        self.scores.get(&player).copied()
    }

    pub fn position(&self, player: PlayerId) -> Option<Position> {
        self.positions.get(player)
    }

    pub fn time_left(&self) -> Duration {
        self.countdown.time_left()
    }

    pub fn flag_ids(&self) -> Vec<String> {
        self.flags.iter().map(|f| f.id.clone()).collect()
    }

    fn flag_index(&self, flag_id: &str) -> Option<usize> {
        self.flags.iter().position(|f| f.id == flag_id)
    }

    pub fn flag_state(&self, flag_id: &str) -> Option<FlagState> {
        self.flag_index(flag_id).map(|i| self.flags[i].state())
    }

    pub fn flag_owner(&self, flag_id: &str) -> Option<TeamIndex> {
        self.flag_index(flag_id).and_then(|i| self.flags[i].owner)
    }

    pub fn locked_players(&self, flag_id: &str) -> Vec<PlayerId> {
        self.flag_index(flag_id)
            .and_then(|i| self.flags[i].activation.as_ref())
            .map(|a| a.locked.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Context id of the minigame running on `flag_id`, if any.
    pub fn running_context(&self, flag_id: &str) -> Option<ContextId> {
        self.flag_index(flag_id)
            .and_then(|i| self.flags[i].minigame.as_ref())
            .map(|slot| slot.id)
    }

    pub fn running_minigames(&self) -> usize {
        self.flags.iter().filter(|f| f.minigame.is_some()).count()
    }

    /// Tokens per team: the worth of every flag the team owns.
    pub fn team_scores(&self) -> [u32; 2] {
        let mut scores = [0, 0];

        for flag in &self.flags {
            if let Some(owner) = flag.owner {
                scores[owner.index()] += flag.proto.worth;
            }
        }

        scores
    }

    /// Stops the countdown, cooldowns and sampling without notifying anyone.
    pub fn shutdown(&mut self) {
        self.countdown.stop();

        for flag in &mut self.flags {
            flag.cooldown.stop();

            if let Some(slot) = flag.minigame.as_mut() {
                slot.stop_timers();
            }
        }

        if let Some(recorder) = self.recorder.as_mut() {
            recorder.timer.stop();
        }
    }

    fn job<F>(&self, f: F) -> Job
    where
        F: FnOnce(&mut Ship, &mut Roster) -> GameResult + Send + 'static,
    {
        let code = self.lobby.clone();
        let id = self.id;

        Box::new(move |mgr: &mut LobbyManager| mgr.with_ship(&code, id, f))
    }

    fn tick_fn<F>(&self, f: F) -> TickFn
    where
        F: Fn(&mut Ship, &mut Roster) -> GameResult + Send + Sync + 'static,
    {
        let code = self.lobby.clone();
        let id = self.id;

        Arc::new(move |mgr: &mut LobbyManager| {
            mgr.with_ship(&code, id, |ship, roster| f(ship, roster))
        })
    }

    fn spawn_teams(&mut self, roster: &Roster) {
        let mut rng = rand::thread_rng();

        for team in TeamIndex::BOTH {
            let [left, middle, right] = self.env.config.team_spawns[team.index()];

            let mut members: Vec<PlayerId> = roster.team(team).members.iter().copied().collect();
            members.shuffle(&mut rng);

            if members.len() == 1 {
                self.positions.set(members[0], middle);
                continue;
            }

            let slots = [left, right, middle];
            for (i, member) in members.into_iter().enumerate() {
                self.positions.set(member, slots[i % slots.len()]);
            }
        }
    }

    fn welcome(&self, roster: &Roster, player: PlayerId) -> GameResult {
        let peers = roster
            .activity_peers(player)
            .into_iter()
            .map(|p| (p, self.positions.get_or_default(p)));

        let flags: Map<String, Value> = self
            .flags
            .iter()
            .map(|flag| {
                let info = json!({
                    "pos": flag.pos.to_value(),
                    "minigame": flag.proto.name,
                    "worth": flag.proto.worth,
                    "player_count": flag.proto.player_count,
                    "cooldown": flag.proto.cooldown.as_secs_f64(),
                });
                (flag.id.clone(), info)
            })
            .collect();

        let msg = Message::new("ship_welcome")
            .with("game_duration", self.env.config.ship_duration.as_secs_f64())
            .with("your_spawn", self.positions.get_or_default(player).to_value())
            .with("peer_spawns", pos_map(roster, peers))
            .with("flags", Value::Object(flags));

        roster.send(player, &msg)
    }

    fn start_countdown(&mut self) {
        info!("lobby {}: starting ship countdown", self.lobby);

        let config = &self.env.config;
        self.countdown = Timer::ticking(
            &self.env.scheduler,
            config.ship_duration,
            config.ship_tick_interval,
            self.tick_fn(|ship, roster| ship.tick(roster)),
            self.job(|ship, roster| ship.trigger_endgame(roster, None)),
        );
    }

    fn start_recording(&mut self) {
        if self.env.sink.is_none() {
            return;
        }

        info!("lobby {}: recording ship data", self.lobby);

        let config = &self.env.config;
        let timer = Timer::ticking(
            &self.env.scheduler,
            config.ship_duration,
            config.record_interval,
            self.tick_fn(|ship, roster| {
                ship.sample_positions(roster);
                Ok(())
            }),
            self.job(|ship, roster| {
                ship.sample_positions(roster);
                Ok(())
            }),
        );

        self.recorder = Some(Recorder::new(timer));
    }

    fn sample_positions(&mut self, roster: &Roster) {
        let Some(recorder) = self.recorder.as_mut() else {
            return;
        };

        let samples = roster
            .in_activity(ActivityKind::Ship)
            .into_iter()
            .filter_map(|p| self.positions.get(p).map(|pos| (p, pos)));

        recorder.sample(roster, samples);
    }

    /// Reports the remaining session time to players walking around the ship.
    fn tick(&mut self, roster: &mut Roster) -> GameResult {
        if self.countdown.has_ended() {
            return Ok(());
        }

        let msg = Message::new("ship_tick")
            .with("seconds_left", self.countdown.time_left().as_secs_f64());

        roster.send_each(roster.in_activity(ActivityKind::Ship), &msg)
    }

    fn ship_players(&self, roster: &Roster) -> Vec<PlayerId> {
        roster.in_activity(ActivityKind::Ship)
    }

    fn flag_for_player(&self, player: PlayerId) -> Option<usize> {
        self.flags.iter().position(|f| f.is_locked(player))
    }

    fn flag_for_context(&self, ctx: ContextId) -> Option<usize> {
        self.flags
            .iter()
            .position(|f| f.minigame.as_ref().map(|s| s.id) == Some(ctx))
    }

    fn slot_mut(&mut self, ctx: ContextId) -> Option<&mut MinigameSlot> {
        self.flags
            .iter_mut()
            .filter_map(|f| f.minigame.as_mut())
            .find(|s| s.id == ctx)
    }

    /// Closest flag within reach. Earlier flags in the layout win exact ties.
    fn nearest_flag(&self, player: PlayerId) -> Option<usize> {
        let pos = self.positions.get(player)?;
        let reach_sq = self.env.config.flag_reach_sq();

        self.flags
            .iter()
            .enumerate()
            .map(|(i, flag)| (i, pos.dist_sq(flag.pos)))
            .filter(|&(_, d)| d <= reach_sq)
            .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal))
            .map(|(i, _)| i)
    }

    /// The recruiting flag that has waited longest and still needs `player`.
    fn oldest_flag_needing(&self, roster: &Roster, player: PlayerId) -> Option<usize> {
        self.flags
            .iter()
            .enumerate()
            .filter(|(_, f)| f.needs_player(roster, player))
            .filter_map(|(i, f)| f.activation.as_ref().map(|a| (a.started, i)))
            .min()
            .map(|(_, i)| i)
    }

    fn is_free(&self, roster: &Roster, player: PlayerId) -> bool {
        roster.get(player).map(|p| p.activity) == Some(ActivityKind::Ship)
            && self.flag_for_player(player).is_none()
    }

    fn try_activate_flag(&mut self, roster: &mut Roster, player: PlayerId) -> GameResult {
        if self.endgame {
            return roster.send(player, &Message::new("ship_no_flags_in_endgame"));
        }

        let Some(idx) = self.nearest_flag(player) else {
            return roster.send(player, &Message::new("ship_no_flags_in_reach"));
        };

        if self.flag_for_player(player).is_some() {
            return roster.send(player, &Message::new("ship_player_locked"));
        }

        let team = roster.player(player)?.team;
        let flag = &self.flags[idx];

        let refusal = if flag.owner == Some(team) {
            Some("ship_flag_already_captured")
        } else if flag.minigame.is_some() {
            Some("ship_flag_in_use")
        } else if !flag.cooldown.has_ended() {
            Some("ship_flag_cooling_down")
        } else if flag.activation.is_some() {
            Some("ship_flag_already_activated")
        } else {
            None
        };

        if let Some(kind) = refusal {
            return roster.send(player, &Message::new(kind).with("flag_id", flag.id.clone()));
        }

        self.activate_flag(roster, player, idx)
    }

    fn activate_flag(&mut self, roster: &mut Roster, player: PlayerId, idx: usize) -> GameResult {
        info!(
            "lobby {}: {} activates flag {}",
            self.lobby,
            roster.name_of(player),
            self.flags[idx].id
        );

        let flag = &mut self.flags[idx];

        if flag.proto.is_single_player() {
            flag.activation = Some(Activation {
                started: Instant::now(),
                locked: BTreeSet::from([player]),
            });

            return self.start_minigame(roster, idx);
        }

        flag.activation = Some(Activation {
            started: Instant::now(),
            locked: BTreeSet::new(),
        });

        join_results([
            self.lock_player(roster, idx, player),
            self.add_players_to_flags(roster),
        ])
    }

    fn lock_player(&mut self, roster: &Roster, idx: usize, player: PlayerId) -> GameResult {
        let flag = &mut self.flags[idx];

        let activation = flag.activation.as_mut().ok_or_else(|| {
            GameError::invariant(format!("locking a player to inactive flag {}", flag.id))
        })?;
        activation.locked.insert(player);

        let name = roster.name_of(player);
        info!("lobby {}: locked {} to flag {}", self.lobby, name, flag.id);

        let own = Message::new("ship_player_lock_set").with("flag_id", flag.id.clone());
        let peer = Message::new("ship_peer_lock_set")
            .with("their_name", name)
            .with("flag_id", flag.id.clone());

        join_results([
            roster.send(player, &own),
            roster.send_each(roster.activity_peers(player), &peer),
        ])
    }

    /// Locks as many free players as possible to recruiting flags and starts the minigames
    /// that become full.
    fn add_players_to_flags(&mut self, roster: &mut Roster) -> GameResult {
        if self.endgame {
            return Ok(());
        }

        let mut eligible: BTreeMap<usize, Vec<PlayerId>> = BTreeMap::new();

        for player in self.ship_players(roster) {
            if self.flag_for_player(player).is_some() {
                continue;
            }

            if let Some(idx) = self.oldest_flag_needing(roster, player) {
                eligible.entry(idx).or_default().push(player);
            }
        }

        let mut results = Vec::new();
        let mut rng = rand::thread_rng();

        for (idx, mut candidates) in eligible {
            loop {
                candidates.retain(|&p| {
                    self.is_free(roster, p) && self.flags[idx].needs_player(roster, p)
                });

                let Some(&chosen) = candidates.choose(&mut rng) else {
                    break;
                };

                results.push(self.lock_player(roster, idx, chosen));
                candidates.retain(|&p| p != chosen);
            }

            if self.flags[idx].has_all_players() {
                debug!("lobby {}: flag {} has all of its players", self.lobby, self.flags[idx].id);
                results.push(self.start_minigame(roster, idx));
            }
        }

        join_results(results)
    }

    fn notify_minigame_start(&self, roster: &Roster, flag_id: &str, locked: &[PlayerId]) -> GameResult {
        let mut results = Vec::new();

        for &player in locked {
            let peers = names(roster, locked.iter().copied().filter(|&p| p != player));
            let msg = Message::new("ship_minigame_join")
                .with("flag_id", flag_id)
                .with("peers", peers);

            results.push(roster.send(player, &msg));
        }

        for watcher in self.ship_players(roster) {
            if locked.contains(&watcher) {
                continue;
            }

            for &player in locked {
                let msg = Message::new("ship_peer_minigame_join")
                    .with("flag_id", flag_id)
                    .with("their_name", roster.name_of(player));

                results.push(roster.send(watcher, &msg));
            }
        }

        join_results(results)
    }

    fn start_minigame(&mut self, roster: &mut Roster, idx: usize) -> GameResult {
        let activation = self.flags[idx].activation.take().ok_or_else(|| {
            GameError::invariant(format!("starting flag {} without activation", self.flags[idx].id))
        })?;

        let locked: Vec<PlayerId> = activation.locked.into_iter().collect();
        let flag_id = self.flags[idx].id.clone();

        info!(
            "lobby {}: starting {} on flag {} with {:?}",
            self.lobby,
            self.flags[idx].proto.name,
            flag_id,
            names(roster, locked.iter().copied())
        );

        let notified = self.notify_minigame_start(roster, &flag_id, &locked);

        self.next_context += 1;
        let ctx = ContextId(self.next_context);
        let imp = (self.flags[idx].proto.construct)();

        self.flags[idx].minigame = Some(MinigameSlot {
            id: ctx,
            imp: Some(imp),
            started: false,
            began: Instant::now(),
            timers: Vec::new(),
        });

        for &player in &locked {
            roster.set_activity(player, ActivityKind::Minigame(ctx))?;
        }

        let started = self.with_minigame(roster, ctx, |imp, ctx| imp.start(ctx));

        if let Some(slot) = self.slot_mut(ctx) {
            slot.started = true;
        }

        join_results([notified, started])
    }

    /// Calls into the minigame running under `ctx` with a fresh context handle.
    fn with_minigame<F>(&mut self, roster: &mut Roster, ctx: ContextId, f: F) -> GameResult
    where
        F: FnOnce(&mut dyn Minigame, &mut MinigameContext<'_>) -> GameResult,
    {
        let idx = self.flag_for_context(ctx).ok_or_else(|| {
            GameError::invariant(format!("no running minigame for context {:?}", ctx))
        })?;

        let mut imp = self.flags[idx]
            .minigame
            .as_mut()
            .and_then(|slot| slot.imp.take())
            .ok_or_else(|| GameError::invariant(format!("minigame {:?} re-entered", ctx)))?;

        let mut handle = MinigameContext {
            ship: self,
            roster,
            id: ctx,
            flag: idx,
            ended: false,
        };

        let result = f(imp.as_mut(), &mut handle);
        let ended = handle.ended;

        if !ended {
            if let Some(slot) = self.slot_mut(ctx) {
                slot.imp = Some(imp);
            }
        }

        result
    }

    pub(crate) fn minigame_timer(&mut self, ctx: ContextId, delay: Duration, tag: u32) -> Timer {
        let timer = Timer::single(
            &self.env.scheduler,
            delay,
            self.job(move |ship, roster| ship.handle_minigame_timer(roster, ctx, tag)),
        );

        if let Some(slot) = self.slot_mut(ctx) {
            slot.timers.retain(|t| !t.has_ended());
            slot.timers.push(timer.stop_handle());
        }

        timer
    }

    fn handle_minigame_timer(&mut self, roster: &mut Roster, ctx: ContextId, tag: u32) -> GameResult {
        if self.flag_for_context(ctx).is_none() {
            return Err(GameError::invariant(format!(
                "timer {} fired for minigame context {:?} after it ended",
                tag, ctx
            )));
        }

        self.with_minigame(roster, ctx, |imp, handle| imp.handle_timer(handle, tag))
    }

    pub(crate) fn record_minigame_session(&mut self, idx: usize, results: Vec<PlayerResult>) {
        let Some(recorder) = self.recorder.as_mut() else {
            return;
        };

        let flag = &self.flags[idx];
        let duration = flag
            .minigame
            .as_ref()
            .map(|slot| slot.began.elapsed().as_secs_f64())
            .unwrap_or_default();

        recorder.add_session(MinigameSession {
            minigame: flag.proto.name.to_string(),
            flag: flag.id.clone(),
            duration_secs: duration,
            ended_at_ms: unix_millis(),
            results,
        });
    }

    /// Routes a message from a player inside the minigame running under `ctx`.
    pub fn handle_minigame_message(
        &mut self,
        roster: &mut Roster,
        ctx: ContextId,
        player: PlayerId,
        message: &Message,
    ) -> GameResult {
        match message.kind() {
            "lobby_bye" => return self.handle_minigame_disconnection(roster, ctx, player),
            "ship_flag_activate" | "ship_mov_position_update" => {
                warn!(
                    "lobby {}: minigame received delayed ship message {} from {}; ignoring",
                    self.lobby,
                    message.kind(),
                    roster.name_of(player)
                );
                return Ok(());
            }
            _ => {}
        }

        let started = self.slot_mut(ctx).map(|slot| slot.started).ok_or_else(|| {
            GameError::invariant(format!("message for minigame context {:?} that is gone", ctx))
        })?;

        if !started {
            warn!(
                "lobby {}: dropping {} for minigame that has not started",
                self.lobby,
                message.kind()
            );
            return Ok(());
        }

        let result = self.with_minigame(roster, ctx, |imp, handle| imp.handle(handle, player, message));

        if let Err(e) = &result {
            warn!(
                "lobby {}: minigame failed handling {} from {}: {}",
                self.lobby,
                message.kind(),
                roster.name_of(player),
                e
            );
        }

        result
    }

    /// Lets the minigame react to a participant leaving. If it does not end itself, the
    /// ship ends it with the default disconnection result.
    pub fn handle_minigame_disconnection(
        &mut self,
        roster: &mut Roster,
        ctx: ContextId,
        player: PlayerId,
    ) -> GameResult {
        let result = self.with_minigame(roster, ctx, |imp, handle| {
            imp.handle_disconnection(handle, player)
        });

        let still_inside =
            roster.get(player).map(|p| p.activity) == Some(ActivityKind::Minigame(ctx));

        if !still_inside {
            return result;
        }

        let Some(idx) = self.flag_for_context(ctx) else {
            return join_results([
                result,
                Err(GameError::invariant(format!(
                    "{} left inside a minigame that no longer exists",
                    roster.name_of(player)
                ))),
            ]);
        };

        warn!(
            "lobby {}: {} did not end after {} left; ending it",
            self.lobby,
            self.flags[idx].proto.name,
            roster.name_of(player)
        );

        let mut handle = MinigameContext {
            ship: self,
            roster,
            id: ctx,
            flag: idx,
            ended: false,
        };

        let forced = handle
            .disconnection(player)
            .and_then(|outcome| handle.end(outcome));

        join_results([result, forced])
    }

    fn start_cooldown(&mut self, idx: usize) {
        let flag = &self.flags[idx];
        info!("lobby {}: cooldown for flag {}", self.lobby, flag.id);

        let cooldown = flag.proto.cooldown;
        let interval = self.env.config.cooldown_tick_interval;

        self.flags[idx].cooldown = Timer::ticking(
            &self.env.scheduler,
            cooldown,
            interval,
            self.tick_fn(move |ship, roster| ship.notify_cooldown(roster, idx, false)),
            self.job(move |ship, roster| ship.notify_cooldown(roster, idx, true)),
        );
    }

    fn notify_cooldown(&mut self, roster: &mut Roster, idx: usize, done: bool) -> GameResult {
        let flag = &self.flags[idx];

        let left = if done {
            0.0
        } else {
            flag.cooldown.time_left().as_secs_f64()
        };

        let msg = Message::new("ship_flag_cooldown_tick")
            .with("flag_id", flag.id.clone())
            .with("time_left", left);

        roster.send_each(self.ship_players(roster), &msg)
    }

    /// Places players on an arc below `around`, all `dist` away from it.
    fn spread_players(&mut self, around: Position, dist: f64, players: &[PlayerId]) {
        match players {
            [] => {}
            [only] => self.positions.set(*only, around + Position::new(0.0, dist)),
            _ => {
                let start = 0.55 * PI;
                let end = 2.0 * PI - start;
                let spacing = (end - start) / (players.len() - 1) as f64;
                let offset = Position::new(0.0, -dist);

                for (i, &player) in players.iter().enumerate() {
                    let rotated = offset.rotate_about_origin(start + i as f64 * spacing);
                    self.positions.set(player, around + rotated);
                }
            }
        }
    }

    fn welcome_back(&self, roster: &Roster, player: PlayerId) -> GameResult {
        let spawn = self.positions.get_or_default(player);

        let peers = roster
            .activity_peers(player)
            .into_iter()
            .map(|p| (p, self.positions.get_or_default(p)));

        let mut states = Map::new();

        for flag in &self.flags {
            let mut info = Map::new();

            if let Some(owner) = flag.owner {
                info.insert("capture_team".into(), owner.into());
            }

            if !flag.cooldown.has_ended() {
                info.insert(
                    "cooldown_left".into(),
                    flag.cooldown.time_left().as_secs_f64().into(),
                );
            }

            if let Some(activation) = &flag.activation {
                info.insert(
                    "locked_players".into(),
                    names(roster, activation.locked.iter().copied()).into(),
                );
            }

            if let Some(slot) = &flag.minigame {
                let ongoing = roster.in_activity(ActivityKind::Minigame(slot.id));
                info.insert("ongoing_players".into(), names(roster, ongoing).into());
            }

            if !info.is_empty() {
                states.insert(flag.id.clone(), Value::Object(info));
            }
        }

        let own = Message::new("ship_welcome_back")
            .with("seconds_left", self.countdown.time_left().as_secs_f64())
            .with("your_spawn", spawn.to_value())
            .with("peer_positions", pos_map(roster, peers))
            .with("flag_states", Value::Object(states));

        let peer = Message::new("ship_welcome_back_peer")
            .with("their_name", roster.name_of(player))
            .with("spawn", spawn.to_value());

        join_results([
            roster.send(player, &own),
            roster.send_each(roster.activity_peers(player), &peer),
        ])
    }

    /// Takes the result of the minigame under `ctx`, returns its participants to the ship
    /// and starts the flag's cooldown.
    pub(crate) fn end_minigame(
        &mut self,
        roster: &mut Roster,
        ctx: ContextId,
        result: MinigameResult,
    ) -> GameResult {
        let idx = self.flag_for_context(ctx).ok_or_else(|| {
            GameError::invariant(format!("ending minigame context {:?} that is not running", ctx))
        })?;

        let flag_id = self.flags[idx].id.clone();
        let proto = Arc::clone(&self.flags[idx].proto);

        info!(
            "lobby {}: {} on flag {} ended with {:?}",
            self.lobby, proto.name, flag_id, result
        );

        if !self.endgame {
            self.start_cooldown(idx);
        }

        if let Some(winner) = result.winner() {
            self.flags[idx].owner = Some(winner);
        }

        let mut finished = Message::new("ship_minigame_finished").with("flag_id", flag_id.clone());
        if let Some(winner) = result.winner() {
            finished.insert("winning_team", winner);
        }

        let mut results = vec![roster.send_each(self.ship_players(roster), &finished)];

        if let Some(mut slot) = self.flags[idx].minigame.take() {
            slot.stop_timers();
        }

        let worth = proto.individual_worth();
        let mut returning = Vec::new();

        for player in roster.in_activity(ActivityKind::Minigame(ctx)) {
            if Some(player) == result.disconnected() {
                continue;
            }

            if result.winner().is_some() && roster.get(player).map(|p| p.team) == result.winner() {
                *self.scores.entry(player).or_insert(0.0) += worth;
            }

            returning.push(player);
        }

        returning.shuffle(&mut rand::thread_rng());

        let pos = self.flags[idx].pos;
        self.spread_players(pos, self.env.config.return_spread, &returning);

        for &player in &returning {
            roster.set_activity(player, ActivityKind::Ship)?;
        }

        for &player in &returning {
            results.push(self.welcome_back(roster, player));
        }

        match result.disconnected() {
            Some(leaver) if roster.contains(leaver) => {
                roster.set_activity(leaver, ActivityKind::Ship)?;
                results.push(self.remove_player(roster, leaver));
            }
            _ if self.countdown.has_ended() => {
                results.push(self.trigger_endgame(roster, None));
            }
            _ => results.push(self.add_players_to_flags(roster)),
        }

        join_results(results)
    }

    /// Removes a player who left while walking around the ship, then enters the endgame.
    fn remove_player(&mut self, roster: &mut Roster, player: PlayerId) -> GameResult {
        let leaver = roster.player(player)?;

        if leaver.activity != ActivityKind::Ship {
            return Err(GameError::invariant(format!(
                "removing {} who is not in the ship activity",
                leaver.name
            )));
        }

        let name = leaver.name.clone();
        let team = leaver.team;

        info!("lobby {}: removing {}", self.lobby, name);

        self.positions.remove(player);
        self.scores.remove(&player);

        for flag in &mut self.flags {
            if let Some(activation) = flag.activation.as_mut() {
                activation.locked.remove(&player);
            }
        }

        if !self.endgame && self.forfeit.is_none() {
            self.forfeit = Some(team.opposing());
        }

        roster.remove(player)?;

        self.trigger_endgame(roster, Some(&name))
    }

    /// Entry point for both endgame triggers: the countdown running out and a player leaving.
    fn trigger_endgame(&mut self, roster: &mut Roster, leaver: Option<&str>) -> GameResult {
        if self.finished {
            return Ok(());
        }

        let left = match leaver {
            Some(name) => roster.broadcast(&Message::new("ship_peer_left").with("their_name", name)),
            None => Ok(()),
        };

        let endgame = if self.endgame {
            self.try_end(roster)
        } else {
            self.enter_endgame(roster)
        };

        join_results([left, endgame])
    }

    fn enter_endgame(&mut self, roster: &mut Roster) -> GameResult {
        info!("lobby {}: entering endgame", self.lobby);

        self.endgame = true;
        self.countdown.stop();

        for flag in &mut self.flags {
            flag.activation = None;
            flag.cooldown.stop();
        }

        let notice = roster.broadcast(&Message::new("ship_endgame"));

        join_results([notice, self.try_end(roster)])
    }

    fn try_end(&mut self, roster: &mut Roster) -> GameResult {
        if self.finished {
            return Ok(());
        }

        let running = self.running_minigames();
        if running > 0 {
            info!(
                "lobby {}: cannot end yet, {} minigame(s) still running",
                self.lobby, running
            );
            return Ok(());
        }

        if let Some(stray) = roster.iter().find(|p| p.activity != ActivityKind::Ship) {
            return Err(GameError::invariant(format!(
                "{} is outside the ship with no minigame running",
                stray.name
            )));
        }

        self.end(roster)
    }

    /// Finishes the session and returns everyone to the lobby activity.
    fn end(&mut self, roster: &mut Roster) -> GameResult {
        info!("lobby {}: ending ship stage", self.lobby);

        self.finished = true;
        self.countdown.stop();

        let team_scores = self.team_scores();
        let individual: Vec<(String, f64)> = self
            .scores
            .iter()
            .filter_map(|(id, score)| roster.get(*id).map(|p| (p.name.clone(), *score)))
            .collect();

        if let Some(recorder) = self.recorder.take() {
            let record = recorder.finish(self.lobby.as_str(), team_scores, &individual);

            if let Some(sink) = &self.env.sink {
                sink.submit(record);
            }
        }

        if roster.is_empty() {
            return Ok(());
        }

        let winner = self.forfeit.or(match team_scores[0].cmp(&team_scores[1]) {
            Ordering::Greater => Some(TeamIndex::Zero),
            Ordering::Less => Some(TeamIndex::One),
            Ordering::Equal => None,
        });

        let individual: Map<String, Value> = individual
            .into_iter()
            .map(|(name, score)| (name, Value::from(score)))
            .collect();

        let mut msg = Message::new("ship_game_end")
            .with("individual_scores", Value::Object(individual))
            .with("team_scores", json!(team_scores));

        if let Some(winner) = winner {
            msg.insert("winning_team", winner);
        }

        roster.set_all_activities(ActivityKind::Lobby);
        roster.broadcast(&msg)
    }
}

impl Activity for Ship {
    fn start(&mut self, roster: &mut Roster) -> GameResult {
        info!("lobby {}: entering ship stage as {}", self.lobby, self.id);

        for id in roster.ids() {
            self.scores.insert(id, 0.0);
        }

        self.spawn_teams(roster);
        roster.set_all_activities(ActivityKind::Ship);

        let welcomed = join_results(roster.ids().into_iter().map(|p| self.welcome(roster, p)));

        self.start_countdown();
        self.start_recording();

        welcomed
    }

    fn handle_message(&mut self, roster: &mut Roster, player: PlayerId, message: &Message) -> GameResult {
        match message.kind() {
            "ship_flag_activate" => self.try_activate_flag(roster, player),
            "lobby_bye" => self.handle_disconnection(roster, player),
            _ => match self.positions.handle_message(roster, player, message) {
                Some(result) => result,
                None => roster.send(player, &Message::new("ship_unknown_message_type_error")),
            },
        }
    }

    fn handle_disconnection(&mut self, roster: &mut Roster, player: PlayerId) -> GameResult {
        let activity = roster.player(player)?.activity;

        match activity {
            ActivityKind::Minigame(ctx) => self.handle_minigame_disconnection(roster, ctx, player),
            _ => self.remove_player(roster, player),
        }
    }
}
