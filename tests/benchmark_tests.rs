//! Coarse timing checks for the hot paths of a tick
//!
//! Thresholds are loose enough for unoptimised test builds; they catch
//! accidental quadratic behaviour, not small regressions.

use client::prediction::Predictor;
use server::channel::Channel;
use server::config::ServerConfig;
use server::historian::{Historian, Pose};
use server::network::{NetworkEvent, Server};
use shared::protocol::{entity_fields, PLAYER_ENTITY};
use shared::{
    decode_frame, encode_frame, standard_registry, Aabb, Command, EngineMessage, EntityUpdate,
    Frame, Handshake, MoveCommand, Record, Section, UsernameCommand, Value,
};
use std::time::Instant;

fn player_record(nid: u16, x: f32, y: f32) -> Record {
    Record::new(
        PLAYER_ENTITY,
        vec![
            Value::U16(nid),
            Value::F32(x),
            Value::F32(y),
            Value::F32(0.0),
            Value::U8(100),
            Value::Bool(true),
            Value::Str(format!("player{}", nid)),
        ],
    )
}

/// Benchmarks encoding and decoding a busy tick frame
#[test]
fn benchmark_frame_codec() {
    let registry = standard_registry().unwrap();
    let mut frame = Frame::new();
    frame.push(Section::Engine(vec![EngineMessage::TickConfirm {
        server_tick: 1,
        client_tick: 1,
    }]));
    frame.push(Section::Creates((1..=50).map(|n| player_record(n, 1.0, 2.0)).collect()));
    frame.push(Section::Updates(
        (1..=400)
            .map(|n| EntityUpdate {
                tag: PLAYER_ENTITY,
                nid: n,
                field: entity_fields::X,
                value: Value::F32(n as f32),
            })
            .collect(),
    ));
    frame.push(Section::Deletes((500..600).collect()));

    let iterations = 2_000;
    let start = Instant::now();
    let mut bytes_total = 0;
    for _ in 0..iterations {
        let bytes = encode_frame(&registry, &frame).unwrap();
        bytes_total += bytes.len();
        let decoded = decode_frame(&registry, &bytes).unwrap();
        assert!(decoded.discarded.is_none());
    }

    let duration = start.elapsed();
    println!(
        "Frame codec: {} round trips ({} KiB) in {:?} ({:.2} μs/iter)",
        iterations,
        bytes_total / 1024,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    assert!(duration.as_secs() < 5);
}

/// Benchmarks interest computation for many sessions over a moving crowd
#[test]
fn benchmark_interest_channel() {
    let mut channel = Channel::new(true);
    for nid in 1..=1_000u16 {
        let x = (nid % 40) as f32 * 50.0 - 1000.0;
        let y = (nid / 40) as f32 * 80.0 - 1000.0;
        channel.add_entity(player_record(nid, x, y), false);
    }
    for session in 0..16u64 {
        let cx = (session % 4) as f32 * 500.0 - 750.0;
        let cy = (session / 4) as f32 * 500.0 - 750.0;
        channel.subscribe(session, Aabb::centered(cx, cy, 1200.0, 900.0));
    }

    let ticks = 100;
    let start = Instant::now();
    let mut changes = 0;
    for tick in 0..ticks {
        for nid in (1..=1_000u16).step_by(3) {
            let x = (nid % 40) as f32 * 50.0 - 1000.0 + tick as f32;
            let y = (nid / 40) as f32 * 80.0 - 1000.0;
            channel.update_entity(player_record(nid, x, y));
        }
        channel.advance();
        for session in 0..16u64 {
            let delta = channel.compute_delta(session);
            changes += delta.created.len() + delta.updated.len() + delta.deleted.len();
        }
    }

    let duration = start.elapsed();
    println!(
        "Interest channel: {} ticks x 16 sessions, {} changes in {:?}",
        ticks, changes, duration
    );

    assert!(changes > 0);
    assert!(duration.as_secs() < 10);
}

/// Benchmarks rewinding a full history buffer
#[test]
fn benchmark_historian_rewind() {
    let mut historian = Historian::new(1_000);
    for tick in 0..60u32 {
        let poses = (1..=500u16).map(|nid| (nid, Pose::new(nid as f32 + tick as f32, 0.0, 0.0)));
        historian.snapshot(tick, tick as u64 * 33, poses);
    }

    let iterations = 2_000;
    let start = Instant::now();
    for i in 0..iterations {
        let poses = historian.rewind((i % 900) as u64).unwrap();
        assert_eq!(poses.len(), 500);
    }

    let duration = start.elapsed();
    println!(
        "Historian rewind: {} rewinds of 500 entities in {:?}",
        iterations, duration
    );

    assert!(duration.as_secs() < 10);
}

/// Benchmarks prediction bookkeeping at a steady confirmation lag
#[test]
fn benchmark_prediction_reconcile() {
    let mut predictor = Predictor::new();
    let iterations = 100_000u32;
    let start = Instant::now();

    for i in 0..iterations {
        let tick = i as u16;
        predictor.record(tick, MoveCommand::default(), i as f32, 0.0);
        if i >= 6 {
            let confirmed = tick.wrapping_sub(6);
            predictor.reconcile(confirmed, (i as f32 - 6.0, 0.0));
        }
    }

    let duration = start.elapsed();
    println!(
        "Prediction: {} ticks in {:?} ({:.2} ns/iter)",
        iterations,
        duration,
        duration.as_nanos() as f64 / iterations as f64
    );

    assert_eq!(predictor.len(), 6);
    assert_eq!(predictor.corrections(), 0);
    assert!(duration.as_secs() < 5);
}

/// Benchmarks full server ticks with a populated world
#[tokio::test]
async fn benchmark_server_tick() {
    let mut server = Server::new(ServerConfig {
        seed: Some(3),
        obstacles: 40,
        props: 40,
        max_clients: 64,
        ..Default::default()
    })
    .unwrap();

    let registry = standard_registry().unwrap();
    let handshake = serde_json::to_string(&Handshake {
        protocol_version: shared::protocol::PROTOCOL_VERSION,
        token: String::new(),
    })
    .unwrap();
    let mut receivers = Vec::new();
    for i in 0..32 {
        let (conn_id, rx) = server.connect_local();
        let mut frame = Frame::new();
        frame.push(Section::Engine(vec![EngineMessage::ConnectionAttempt {
            handshake: handshake.clone(),
        }]));
        let bytes = encode_frame(&registry, &frame).unwrap();
        server.handle_event(NetworkEvent::Packet { conn_id, bytes });
        assert!(server.process_next_event().await);

        let mut frame = Frame::new();
        frame.push(Section::Commands(vec![
            Command::Username(UsernameCommand {
                username: format!("bot{}", i),
            }),
            Command::Move(MoveCommand {
                right: i % 2 == 0,
                down: i % 3 == 0,
                delta: 1.0 / 30.0,
                ..Default::default()
            }),
        ]));
        let bytes = encode_frame(&registry, &frame).unwrap();
        server.handle_event(NetworkEvent::Packet { conn_id, bytes });
        receivers.push(rx);
    }

    let ticks = 300u64;
    let start = Instant::now();
    for tick in 1..=ticks {
        server.tick(tick * 33);
        for rx in &mut receivers {
            while rx.try_recv().is_ok() {}
        }
    }

    let duration = start.elapsed();
    println!(
        "Server tick: {} ticks with 32 players in {:?} ({:.2} ms/tick)",
        ticks,
        duration,
        duration.as_secs_f64() * 1000.0 / ticks as f64
    );

    assert_eq!(server.game().player_count(), 32);
    assert!(duration.as_secs() < 20);
}
