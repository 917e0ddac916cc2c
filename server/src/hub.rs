//! The coordination loop.
//!
//! One hub task owns the client manager and the lobby manager, and with them every lobby,
//! ship and minigame. Network tasks and timers never touch that state: they hand work to the
//! hub through channels and the hub processes it one item at a time. Pending work is taken
//! in a fixed priority order: forced disconnects, then timer jobs, then client traffic.

use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::client::{ClientId, Connection};
use crate::client_manager::ClientManager;
use crate::config::GameConfig;
use crate::error::{GameError, GameResult};
use crate::lobby_manager::{GameEnv, LobbyManager};
use crate::minigame::Registry;
use crate::recorder::RecordSink;
use crate::timer::{Job, Scheduler};
use shared::Message;

/// What the network layer reports about a client.
#[derive(Debug)]
pub enum Intake {
    Connected(Connection),
    Message { client: ClientId, message: Message },
    Closed(ClientId),
}

/// One unit of coordination work.
pub enum Work {
    Kill(ClientId),
    Job(Job),
    Intake(Intake),
}

impl std::fmt::Debug for Work {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Work::Kill(client) => write!(f, "Kill({})", client),
            Work::Job(_) => write!(f, "Job"),
            Work::Intake(intake) => write!(f, "Intake({:?})", intake),
        }
    }
}

/// Cloneable sending side of the hub, handed to connection tasks.
#[derive(Debug, Clone)]
pub struct HubHandle {
    intake: mpsc::UnboundedSender<Intake>,
    kill: mpsc::UnboundedSender<ClientId>,
}

impl HubHandle {
    fn submit(&self, intake: Intake) {
        if self.intake.send(intake).is_err() {
            warn!("hub is gone; dropping client event");
        }
    }

    pub fn connected(&self, conn: Connection) {
        self.submit(Intake::Connected(conn));
    }

    pub fn message(&self, client: ClientId, message: Message) {
        self.submit(Intake::Message { client, message });
    }

    pub fn closed(&self, client: ClientId) {
        self.submit(Intake::Closed(client));
    }

    /// Forces a client off the server ahead of any queued traffic.
    pub fn kill(&self, client: ClientId) {
        if self.kill.send(client).is_err() {
            warn!("hub is gone; dropping kill for client {}", client);
        }
    }
}

pub struct Hub {
    clients: ClientManager,
    manager: LobbyManager,
    kill: mpsc::UnboundedSender<ClientId>,
    intake: mpsc::UnboundedReceiver<Intake>,
    kills: mpsc::UnboundedReceiver<ClientId>,
    jobs: mpsc::UnboundedReceiver<Job>,
}

impl Hub {
    /// Builds the hub and the handle network tasks use to reach it. The loop stops once the
    /// handle and all of its clones are dropped.
    pub fn new(
        config: GameConfig,
        registry: Registry,
        sink: Option<Arc<dyn RecordSink>>,
        max_clients: usize,
    ) -> (Self, HubHandle) {
        let (scheduler, jobs) = Scheduler::new();
        let (intake_tx, intake) = mpsc::unbounded_channel();
        let (kill_tx, kills) = mpsc::unbounded_channel();

        let mut env = GameEnv::new(config, registry, scheduler);
        if let Some(sink) = sink {
            env = env.with_sink(sink);
        }

        let hub = Hub {
            clients: ClientManager::new(max_clients),
            manager: LobbyManager::new(Arc::new(env)),
            kill: kill_tx.clone(),
            intake,
            kills,
            jobs,
        };

        let handle = HubHandle {
            intake: intake_tx,
            kill: kill_tx,
        };

        (hub, handle)
    }

    pub fn manager(&self) -> &LobbyManager {
        &self.manager
    }

    pub fn clients(&self) -> &ClientManager {
        &self.clients
    }

    /// Waits for the next unit of work. Returns `None` once every handle is gone.
    pub async fn next_work(&mut self) -> Option<Work> {
        tokio::select! {
            biased;

            Some(client) = self.kills.recv() => Some(Work::Kill(client)),
            Some(job) = self.jobs.recv() => Some(Work::Job(job)),
            intake = self.intake.recv() => intake.map(Work::Intake),
        }
    }

    /// Takes already-queued work without waiting, in priority order.
    pub fn try_next_work(&mut self) -> Option<Work> {
        if let Ok(client) = self.kills.try_recv() {
            return Some(Work::Kill(client));
        }

        if let Ok(job) = self.jobs.try_recv() {
            return Some(Work::Job(job));
        }

        self.intake.try_recv().ok().map(Work::Intake)
    }

    /// Processes everything currently queued. Returns how many items ran.
    pub fn run_pending(&mut self) -> usize {
        let mut count = 0;

        while let Some(work) = self.try_next_work() {
            self.process(work);
            count += 1;
        }

        count
    }

    pub async fn run(mut self) {
        info!("Coordination loop started");

        while let Some(work) = self.next_work().await {
            self.process(work);
        }

        info!("Coordination loop stopped: all client handles dropped");
    }

    pub fn process(&mut self, work: Work) {
        debug!("processing {:?}", work);

        let result = match work {
            Work::Kill(client) => self.drop_client(client),
            Work::Job(job) => job(&mut self.manager),
            Work::Intake(Intake::Connected(conn)) => {
                self.clients.add_client(conn);
                Ok(())
            }
            Work::Intake(Intake::Message { client, message }) => self.receive(client, &message),
            Work::Intake(Intake::Closed(client)) => self.drop_client(client),
        };

        self.settle(result);
    }

    fn receive(&mut self, client: ClientId, message: &Message) -> GameResult {
        let Some(conn) = self.clients.get(client).cloned() else {
            debug!("dropping {} from departed client {}", message.kind(), client);
            return Ok(());
        };

        self.manager.receive(&conn, message)
    }

    fn drop_client(&mut self, client: ClientId) -> GameResult {
        let Some(conn) = self.clients.remove_client(client) else {
            return Ok(());
        };

        let result = self.manager.disconnect(client);
        conn.close();

        result
    }

    /// Logs the outcome of one work item and drops clients that can no longer be served.
    fn settle(&mut self, result: GameResult) {
        if let Err(e) = result {
            let mut behind = Vec::new();
            backlogged(&e, &mut behind);

            for client in behind {
                warn!("client {} is not keeping up; disconnecting", client);
                if self.kill.send(client).is_err() {
                    error!("kill queue is closed");
                }
            }

            if e.is_invariant() {
                error!("{}", e);
            } else {
                warn!("{}", e);
            }
        }

        for client in self.manager.take_doomed() {
            if let Some(conn) = self.clients.remove_client(client) {
                conn.close();
            }
        }
    }
}

/// Clients whose outbound queue overflowed somewhere in `error`.
fn backlogged(error: &GameError, out: &mut Vec<ClientId>) {
    match error {
        GameError::QueueFull(client) => out.push(*client),
        GameError::Multiple(errors) => errors.iter().for_each(|e| backlogged(e, out)),
        _ => {}
    }
}
