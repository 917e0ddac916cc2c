//! Scripted bot for poking a running server by hand.
//!
//! Creates a lobby (or joins one with `--join`), readies up, walks to a flag and plays
//! whatever minigame starts there with random or trivial moves until the session ends.

use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use rand::seq::SliceRandom;
use rand::Rng;
use std::time::Duration;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as Frame;

use shared::{Message, Position};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// WebSocket URL of the server
    #[clap(long, default_value = "ws://127.0.0.1:8080")]
    url: String,
    /// Join this lobby instead of creating one
    #[clap(long)]
    join: Option<String>,
    /// Flag to walk to; defaults to the first one listed
    #[clap(long)]
    flag: Option<String>,
    /// Give up after this many seconds
    #[clap(long, default_value = "120")]
    seconds: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let (socket, _) = connect_async(args.url.as_str()).await?;
    println!("Connected to {}", args.url);
    let (mut sink, mut frames) = socket.split();

    let opening = match &args.join {
        Some(code) => Message::new("lobby_join").with("lobby_id", code.as_str()),
        None => Message::new("lobby_create"),
    };
    sink.send(Frame::Text(opening.encode()?)).await?;

    let deadline = Duration::from_secs(args.seconds);
    let mut rng = rand::thread_rng();

    loop {
        let frame = match timeout(deadline, frames.next()).await {
            Ok(Some(frame)) => frame?,
            Ok(None) => {
                println!("Server closed the connection");
                break;
            }
            Err(_) => {
                println!("Timed out waiting for the server");
                break;
            }
        };

        let Frame::Text(text) = frame else {
            continue;
        };
        let message = Message::parse(&text)?;
        println!("<- {}", text);

        let replies = match message.kind() {
            "lobby_welcome" => {
                println!("In lobby {}", message.get_str("lobby_id").unwrap_or("?"));
                vec![Message::new("lobby_ready_change").with("ready", true)]
            }
            "ship_welcome" => {
                let target = pick_flag(&message, args.flag.as_deref());
                match target {
                    Some((id, pos)) => {
                        println!("Walking to flag {}", id);
                        vec![
                            Message::new("ship_mov_position_update")
                                .with("x", pos.x)
                                .with("y", pos.y),
                            Message::new("ship_flag_activate"),
                        ]
                    }
                    None => Vec::new(),
                }
            }
            "rps_selection_start" => {
                let element = ["rock", "paper", "scissors"].choose(&mut rng).copied().unwrap_or("rock");
                vec![Message::new("rps_selection").with("element", element)]
            }
            "cps_timeout" => {
                vec![Message::new("cps_report").with("clicks", rng.gen_range(10..60))]
            }
            "mole_welcome" => first_mole(&message, "initial_moles"),
            "mole_hit_valid" => first_mole(&message, "new_moles"),
            "mole_timeout" => first_mole(&message, "locations"),
            "demo_mov_spawn" => {
                vec![Message::new("demo_mov_position_update").with("x", 200.0).with("y", 0.0)]
            }
            "ship_game_end" => {
                println!("Session over");
                break;
            }
            _ => Vec::new(),
        };

        for reply in replies {
            println!("-> {}", reply.kind());
            sink.send(Frame::Text(reply.encode()?)).await?;
        }
    }

    sink.send(Frame::Text(Message::new("lobby_bye").encode()?)).await?;
    sink.close().await?;
    println!("Test client finished");

    Ok(())
}

fn pick_flag(welcome: &Message, wanted: Option<&str>) -> Option<(String, Position)> {
    let flags = welcome.get("flags")?.as_object()?;

    let (id, info) = match wanted {
        Some(id) => flags.get_key_value(id)?,
        None => flags.iter().next()?,
    };

    Some((id.clone(), Position::from_value(info.get("pos")?)?))
}

fn first_mole(message: &Message, key: &str) -> Vec<Message> {
    message
        .get(key)
        .and_then(|v| v.as_array())
        .and_then(|moles| moles.first())
        .and_then(|loc| loc.as_u64())
        .map(|loc| vec![Message::new("mole_hit").with("location", loc)])
        .unwrap_or_default()
}
