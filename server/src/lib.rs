//! # Game Server Library
//!
//! This library provides the authoritative backend for a team-based party game. Browsers
//! connect over WebSockets, gather in lobbies, and once both teams are ready they are
//! moved onto a shared ship map where flags gate short minigames. Winning a minigame
//! captures its flag for the team; whoever holds the most tokens when the ship countdown
//! runs out wins the session.
//!
//! ## Core Responsibilities
//!
//! ### Session Flow
//! Every player is in exactly one activity at a time: the lobby, the ship, or a running
//! minigame. The lobby decides when a ship starts, the ship decides when minigames start
//! and end, and the ship's endgame decides when everyone goes back to the lobby.
//!
//! ### Client Management
//! Handles the lifecycle of client connections:
//! - Accepting sockets and enforcing the connection limit
//! - Routing each parsed message to the client's lobby
//! - Running the leave path when a socket closes or falls behind
//!
//! ### Minigames
//! Minigames are plugged in through [`minigame::Minigame`] and described by a
//! [`minigame::MinigamePrototype`]. They only see their participants through a
//! [`minigame::MinigameContext`] and report exactly one result.
//!
//! ## Architecture Design
//!
//! ### Single Coordination Loop
//! All game state is owned by one [`hub::Hub`] task that processes work items one at a
//! time. Connection tasks and timers never touch that state; they submit work through
//! channels. This removes every lock from the game logic and makes turn order explicit.
//!
//! ### Timers As Jobs
//! Countdowns, cooldowns and minigame clocks are background tasks that only wait. When
//! they fire they queue a job for the hub. Stopping a timer guarantees its callback never
//! runs, even if the job was already queued.
//!
//! ## Module Organization
//!
//! - `network`: WebSocket accept loop and per-connection reader and writer tasks
//! - `hub`: the coordination loop and its work priorities
//! - `client` / `client_manager`: outbound queues and connected clients
//! - `lobby_manager` / `lobby`: lobby codes, staging, team and ready changes
//! - `roster`: players, teams and activity membership
//! - `ship`: the ship map, flags, endgame and scoring
//! - `minigame` / `minigames`: the plug-in contract and the bundled games
//! - `movement`: position relay shared by the ship and movement-based minigames
//! - `timer`: cancellable scheduled jobs
//! - `recorder`: optional play-test analytics
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::GameConfig;
//! use server::hub::Hub;
//! use server::minigames::standard_registry;
//! use server::network::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // The hub owns all game state; the handle is how connections reach it
//!     let (hub, handle) = Hub::new(GameConfig::default(), standard_registry(), None, 256);
//!     let server = Server::bind("127.0.0.1:8080", handle).await?;
//!
//!     tokio::spawn(hub.run());
//!     server.run().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod activity;
pub mod client;
pub mod client_manager;
pub mod config;
pub mod error;
pub mod hub;
pub mod lobby;
pub mod lobby_manager;
pub mod minigame;
pub mod minigames;
pub mod movement;
pub mod network;
pub mod recorder;
pub mod roster;
pub mod ship;
pub mod timer;
pub mod utils;
