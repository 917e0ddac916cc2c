//! A lobby with one flag, driven the way the hub drives it.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::client::tests::drain;
use crate::client::{ClientId, Connection, Outbound};
use crate::config::{FlagPlacement, GameConfig};
use crate::lobby::LobbyCode;
use crate::lobby_manager::{GameEnv, LobbyManager};
use crate::minigames::standard_registry;
use crate::roster::tests::conn;
use crate::roster::PlayerId;
use crate::ship::Ship;
use crate::timer::{Job, Scheduler};
use shared::Message;

pub(crate) struct Table {
    pub mgr: LobbyManager,
    pub code: LobbyCode,
    jobs: mpsc::UnboundedReceiver<Job>,
    seats: Vec<(Connection, mpsc::Receiver<Outbound>)>,
}

impl Table {
    /// Seats `per_team` players on each team around a single flag at the origin and starts
    /// the ship. Even seats are team 0, odd seats team 1.
    pub fn new(minigame: &str, per_team: usize) -> Self {
        let (scheduler, jobs) = Scheduler::new();
        let config = GameConfig {
            layout: vec![FlagPlacement::new("flag", minigame, 0.0, 0.0)],
            ..GameConfig::default()
        };
        let env = GameEnv::new(config, standard_registry(), scheduler);
        let mut mgr = LobbyManager::new(Arc::new(env));

        let mut seats = Vec::new();
        for n in 0..(2 * per_team as u32) {
            seats.push(conn(n + 1));
        }

        mgr.receive(&seats[0].0, &Message::new("lobby_create")).unwrap();
        let welcome = drain(&mut seats[0].1);
        let code = LobbyCode::new(welcome[0].get_str("lobby_id").unwrap());

        for (c, _) in seats.iter().skip(1) {
            mgr.join(code.clone(), c.clone()).unwrap();
        }

        let ready = Message::new("lobby_ready_change").with("ready", true);
        for (c, _) in &seats {
            mgr.receive(c, &ready).unwrap();
        }

        let mut table = Table {
            mgr,
            code,
            jobs,
            seats,
        };
        assert!(table.ship().is_some(), "ship did not start");

        for i in 0..table.seats.len() {
            table.messages(i);
        }

        table
    }

    pub fn player(&self, i: usize) -> PlayerId {
        self.mgr.player_of(ClientId(i as u32 + 1)).unwrap().1
    }

    pub fn ship(&self) -> Option<&Ship> {
        self.mgr.lobby(&self.code).and_then(|lobby| lobby.ship())
    }

    pub fn send(&mut self, i: usize, message: Message) {
        let c = self.seats[i].0.clone();
        self.mgr.receive(&c, &message).unwrap();
    }

    pub fn messages(&mut self, i: usize) -> Vec<Message> {
        drain(&mut self.seats[i].1)
    }

    pub fn kinds(&mut self, i: usize) -> Vec<String> {
        self.messages(i).iter().map(|m| m.kind().to_string()).collect()
    }

    /// The message of the given type most recently sent to seat `i`. Drains the queue.
    pub fn last_of(&mut self, i: usize, kind: &str) -> Option<Message> {
        self.messages(i).into_iter().filter(|m| m.kind() == kind).last()
    }

    /// Walks seat `i` onto the flag and activates it. Free players are pulled in.
    pub fn activate(&mut self, i: usize) {
        self.send(i, Message::new("ship_mov_position_update").with("x", 0.0).with("y", 0.0));
        self.send(i, Message::new("ship_flag_activate"));
    }

    pub fn disconnect(&mut self, i: usize) {
        self.mgr.disconnect(ClientId(i as u32 + 1)).unwrap();
    }

    /// Lets time pass, then runs every job that became due.
    pub async fn advance(&mut self, by: Duration) {
        tokio::time::sleep(by).await;
        self.run_jobs().await;
    }

    pub async fn run_jobs(&mut self) {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }

        while let Ok(job) = self.jobs.try_recv() {
            job(&mut self.mgr).unwrap();
        }
    }
}
