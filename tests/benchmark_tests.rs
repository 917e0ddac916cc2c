//! Performance benchmarks for hot paths of the coordination loop

use server::client::{ClientId, Connection, Outbound};
use server::config::GameConfig;
use server::hub::Hub;
use server::minigames::standard_registry;
use server::utils::random_username;
use shared::{Message, Position};
use std::net::SocketAddr;
use std::time::Instant;
use tokio::sync::mpsc;

fn addr() -> SocketAddr {
    "127.0.0.1:9000".parse().unwrap()
}

fn drain(rx: &mut mpsc::Receiver<Outbound>) -> usize {
    let mut count = 0;
    while rx.try_recv().is_ok() {
        count += 1;
    }
    count
}

/// Benchmarks parsing of inbound frames
#[test]
fn benchmark_message_parsing() {
    let frame = r#"{"type":"ship_mov_position_update","x":123.5,"y":-42.25}"#;

    let iterations = 100_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let message = Message::parse(frame).unwrap();
        assert_eq!(message.kind(), "ship_mov_position_update");
    }

    let duration = start.elapsed();
    println!(
        "Message parsing: {} iterations in {:?} ({:.2} ns/iter)",
        iterations,
        duration,
        duration.as_nanos() as f64 / iterations as f64
    );

    // Should complete in under 2 seconds
    assert!(duration.as_millis() < 2000);
}

/// Benchmarks encoding of the largest message the server sends regularly
#[test]
fn benchmark_welcome_encoding() {
    let mut flags = serde_json::Map::new();
    for i in 0..9 {
        flags.insert(
            format!("flag{}", i),
            serde_json::json!({
                "pos": Position::new(i as f64 * 64.0, -(i as f64) * 32.0).to_value(),
                "minigame": "cps_race_sp",
                "state": "idle",
            }),
        );
    }

    let message = Message::new("ship_welcome")
        .with("game_duration", 600.0)
        .with("your_spawn", Position::new(0.0, 416.0).to_value())
        .with("flags", serde_json::Value::Object(flags));

    let iterations = 10_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let frame = message.encode().unwrap();
        assert!(!frame.is_empty());
    }

    let duration = start.elapsed();
    println!(
        "Welcome encoding: {} iterations in {:?} ({:.2} μs/iter)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    // Should complete in under 2 seconds
    assert!(duration.as_millis() < 2000);
}

/// Benchmarks username generation in a nearly full lobby
#[test]
fn benchmark_username_generation() {
    let mut rng = rand::thread_rng();
    let taken = ["Albatross", "Anchovy", "Axolotl", "Barnacle", "Beluga"];

    let iterations = 10_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let name = random_username(&mut rng, |n| taken.contains(&n));
        assert!(!taken.contains(&name.as_str()));
    }

    let duration = start.elapsed();
    println!(
        "Username generation: {} iterations in {:?} ({:.2} μs/iter)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    // Should complete in under 1 second
    assert!(duration.as_millis() < 1000);
}

/// Stress tests the hub with position updates relayed between two ship players
#[tokio::test]
async fn stress_test_position_relay() {
    let (mut hub, handle) = Hub::new(GameConfig::default(), standard_registry(), None, 8);

    let (a, mut rx_a) = Connection::channel(ClientId(1), addr());
    let (b, mut rx_b) = Connection::channel(ClientId(2), addr());
    handle.connected(a);
    handle.connected(b);

    handle.message(ClientId(1), Message::new("lobby_create"));
    hub.run_pending();
    let code = hub.manager().lobby_codes()[0].as_str().to_string();

    handle.message(ClientId(2), Message::new("lobby_join").with("lobby_id", code.as_str()));
    let ready = Message::new("lobby_ready_change").with("ready", true);
    handle.message(ClientId(1), ready.clone());
    handle.message(ClientId(2), ready);
    hub.run_pending();
    drain(&mut rx_a);
    drain(&mut rx_b);

    let iterations = 20_000;
    let start = Instant::now();

    for i in 0..iterations {
        let update = Message::new("ship_mov_position_update")
            .with("x", (i % 400) as f64)
            .with("y", 0.0);
        handle.message(ClientId(1), update);

        // Keep the peer's queue from filling up.
        if i % 100 == 0 {
            hub.run_pending();
            drain(&mut rx_b);
        }
    }
    hub.run_pending();
    drain(&mut rx_b);

    let duration = start.elapsed();
    println!(
        "Position relay: {} updates in {:?} ({:.2} μs/update)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    // Both players must still be connected; a dropped client means the relay fell behind.
    assert_eq!(hub.clients().len(), 2);
    assert!(duration.as_millis() < 5000);
}
