//! Integration tests across the shared, server and client crates
//!
//! Every connection here is an in-process channel standing in for a socket:
//! bytes go in through `NetworkEvent::Packet` and come out of the receiver
//! exactly as a socket writer would see them.

use client::game::{ClientGame, Mirror};
use client::input::Intent;
use client::prediction::Reconciliation;
use server::config::ServerConfig;
use assert_approx_eq::assert_approx_eq;
use server::endpoints::{self, EndpointRegistry};
use server::handshake::{HandshakeFuture, HandshakeHook};
use server::network::{NetworkEvent, Server};
use server::session::{ConnectionId, Outbound};
use shared::protocol::PROTOCOL_VERSION;
use shared::{
    decode_frame, encode_frame, standard_registry, Command, EngineMessage, Frame, Handshake,
    Message, Section, ShotImpactCommand, UsernameCommand,
};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};

const TICK_MS: u64 = 33;

fn config() -> ServerConfig {
    ServerConfig {
        obstacles: 0,
        props: 0,
        seed: Some(7),
        ..Default::default()
    }
}

fn encode(server: &Server, sections: Vec<Section>) -> Vec<u8> {
    let mut frame = Frame::new();
    for section in sections {
        frame.push(section);
    }
    encode_frame(server.registry(), &frame).unwrap()
}

fn send(server: &mut Server, conn_id: ConnectionId, sections: Vec<Section>) {
    let bytes = encode(server, sections);
    server.handle_event(NetworkEvent::Packet { conn_id, bytes });
}

fn attempt_section() -> Section {
    let handshake = serde_json::to_string(&Handshake {
        protocol_version: PROTOCOL_VERSION,
        token: String::new(),
    })
    .unwrap();
    Section::Engine(vec![EngineMessage::ConnectionAttempt { handshake }])
}

fn username(name: &str) -> Section {
    Section::Commands(vec![Command::Username(UsernameCommand {
        username: name.to_string(),
    })])
}

/// Decodes everything written to a connection so far.
fn drain(server: &Server, rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<Frame> {
    let mut frames = Vec::new();
    while let Ok(item) = rx.try_recv() {
        if let Outbound::Frame(bytes) = item {
            frames.push(decode_frame(server.registry(), &bytes).unwrap());
        }
    }
    frames
}

fn messages(frames: &[Frame]) -> Vec<Message> {
    frames.iter().flat_map(|f| f.messages().cloned()).collect()
}

async fn accepted(server: &mut Server) -> (ConnectionId, mpsc::UnboundedReceiver<Outbound>) {
    let (conn_id, rx) = server.connect_local();
    send(server, conn_id, vec![attempt_section()]);
    assert!(server.process_next_event().await);
    assert!(server.sessions().get(conn_id).unwrap().is_open());
    (conn_id, rx)
}

struct Clock {
    now_ms: u64,
}

impl Clock {
    fn new() -> Self {
        Self { now_ms: 0 }
    }

    fn tick(&mut self, server: &mut Server) -> server::game::TickReport {
        self.now_ms += TICK_MS;
        server.tick(self.now_ms)
    }
}

mod session_tests {
    use super::*;

    #[tokio::test]
    async fn first_username_gets_entity_and_identity() {
        let mut server = Server::new(config()).unwrap();
        let mut clock = Clock::new();
        let (first, mut first_rx) = accepted(&mut server).await;
        let (second, mut second_rx) = accepted(&mut server).await;

        send(&mut server, first, vec![username("AAA")]);
        let report = clock.tick(&mut server);
        assert_eq!(report.spawned, vec![1]);
        assert_eq!(
            messages(&drain(&server, &mut first_rx)),
            vec![Message::Identity { my_id: 1 }]
        );
        drain(&server, &mut second_rx);

        send(&mut server, second, vec![username("AAA")]);
        let report = clock.tick(&mut server);
        assert!(report.spawned.is_empty());
        assert_eq!(server.game().player_count(), 1);
        assert!(messages(&drain(&server, &mut second_rx)).is_empty());
        assert_eq!(server.sessions().get(second).unwrap().entity_nid, None);
    }

    #[tokio::test]
    async fn user_ids_are_never_reused() {
        let mut server = Server::new(config()).unwrap();
        let (first, _rx) = accepted(&mut server).await;
        assert_eq!(server.sessions().get(first).unwrap().user_id, Some(1));

        server.handle_event(NetworkEvent::Closed { conn_id: first });
        let (second, _rx) = accepted(&mut server).await;
        assert_eq!(server.sessions().get(second).unwrap().user_id, Some(2));
    }

    #[tokio::test]
    async fn full_server_denies_new_attempts() {
        let mut server = Server::new(ServerConfig {
            max_clients: 1,
            ..config()
        })
        .unwrap();
        let (_first, _rx) = accepted(&mut server).await;

        let (late, mut late_rx) = server.connect_local();
        send(&mut server, late, vec![attempt_section()]);

        let frames = drain(&server, &mut late_rx);
        assert_eq!(
            frames[0].engine_messages().next(),
            Some(&EngineMessage::ConnectionDenied {
                reason: "server full".to_string()
            })
        );
        assert!(server.sessions().get(late).is_none());
    }

    #[tokio::test]
    async fn truncated_packet_drops_only_that_connection() {
        let mut server = Server::new(config()).unwrap();
        let mut clock = Clock::new();
        let (bad, _bad_rx) = accepted(&mut server).await;
        let (good, mut good_rx) = accepted(&mut server).await;
        send(&mut server, bad, vec![username("bad")]);
        send(&mut server, good, vec![username("good")]);
        clock.tick(&mut server);
        let bad_nid = server.sessions().get(bad).unwrap().entity_nid.unwrap();
        server.game_mut().place_entity(bad_nid, 0.0, 0.0);
        let good_nid = server.sessions().get(good).unwrap().entity_nid.unwrap();
        server.game_mut().place_entity(good_nid, 50.0, 0.0);
        clock.tick(&mut server);
        drain(&server, &mut good_rx);

        let mut bytes = encode(&server, vec![username("again")]);
        bytes.truncate(bytes.len() - 2);
        server.handle_event(NetworkEvent::Packet { conn_id: bad, bytes });

        assert!(server.sessions().get(bad).is_none());
        assert!(server.game().entity(bad_nid).is_none());
        assert!(server.sessions().get(good).unwrap().is_open());

        clock.tick(&mut server);
        let deletes: Vec<u16> = drain(&server, &mut good_rx)
            .iter()
            .flat_map(|f| f.deletes().copied().collect::<Vec<_>>())
            .collect();
        assert_eq!(deletes, vec![bad_nid]);
    }
}

mod handshake_tests {
    use super::*;

    /// Holds every handshake until released.
    struct GatedHook {
        gate: Arc<Notify>,
    }

    impl HandshakeHook for GatedHook {
        fn accept(&self, _handshake: Handshake) -> HandshakeFuture {
            let gate = self.gate.clone();
            Box::pin(async move {
                gate.notified().await;
                Ok(())
            })
        }
    }

    fn gated_server(gate: Arc<Notify>) -> Server {
        Server::with_parts(
            config(),
            Arc::new(standard_registry().unwrap()),
            Arc::new(EndpointRegistry::with_builtins()),
            Arc::new(GatedHook { gate }),
        )
    }

    #[tokio::test]
    async fn close_during_pending_handshake_never_registers() {
        let gate = Arc::new(Notify::new());
        let mut server = gated_server(gate.clone());
        let (conn_id, mut rx) = server.connect_local();
        send(&mut server, conn_id, vec![attempt_section()]);

        server.handle_event(NetworkEvent::Closed { conn_id });
        assert!(server.sessions().get(conn_id).is_none());

        gate.notify_one();
        assert!(server.process_next_event().await);

        assert!(server.sessions().is_empty());
        assert_eq!(server.sessions().peek_next_user_id(), 1);
        assert!(drain(&server, &mut rx).is_empty());
    }

    #[tokio::test]
    async fn commands_wait_for_handshake() {
        let gate = Arc::new(Notify::new());
        let mut server = gated_server(gate.clone());
        let mut clock = Clock::new();
        let (conn_id, mut rx) = server.connect_local();
        send(&mut server, conn_id, vec![attempt_section(), username("early")]);
        clock.tick(&mut server);
        assert_eq!(server.game().player_count(), 0);

        gate.notify_one();
        assert!(server.process_next_event().await);
        let frames = drain(&server, &mut rx);
        assert_eq!(
            frames[0].engine_messages().next(),
            Some(&EngineMessage::ConnectionAccepted)
        );

        send(&mut server, conn_id, vec![username("late")]);
        let report = clock.tick(&mut server);
        assert_eq!(report.spawned.len(), 1);
    }
}

mod combat_tests {
    use super::*;

    fn shot(to_x: f32, force: f32, target_nid: u16) -> Section {
        Section::Commands(vec![Command::ShotImpact(ShotImpactCommand {
            from_x: 0.0,
            from_y: 0.0,
            hit_x: to_x,
            hit_y: 0.0,
            impact_force: force,
            target_nid,
        })])
    }

    #[tokio::test]
    async fn lethal_rewound_shot_kills_and_frees_username() {
        let mut server = Server::new(config()).unwrap();
        let mut clock = Clock::new();
        let (shooter, mut shooter_rx) = accepted(&mut server).await;
        let (target, mut target_rx) = accepted(&mut server).await;
        send(&mut server, shooter, vec![username("AAA")]);
        send(&mut server, target, vec![username("BBB")]);
        clock.tick(&mut server);
        let shooter_nid = server.sessions().get(shooter).unwrap().entity_nid.unwrap();
        let target_nid = server.sessions().get(target).unwrap().entity_nid.unwrap();

        server.game_mut().place_entity(shooter_nid, 0.0, 0.0);
        server.game_mut().place_entity(target_nid, 100.0, 0.0);
        for _ in 0..8 {
            clock.tick(&mut server);
        }
        // The target steps out of the line of fire just before the shot lands
        server.game_mut().place_entity(target_nid, 100.0, 300.0);
        clock.tick(&mut server);
        drain(&server, &mut shooter_rx);
        drain(&server, &mut target_rx);

        send(&mut server, shooter, vec![shot(200.0, 150.0, 0)]);
        let report = clock.tick(&mut server);

        assert_eq!(report.hits.len(), 1);
        let hit = &report.hits[0];
        assert_eq!(hit.target, target_nid);
        assert_eq!(hit.health, Some(0));
        assert!(!hit.is_alive);
        assert!(hit.rewound);
        assert_eq!(report.removed, vec![target_nid]);
        assert_eq!(server.sessions().get(target).unwrap().entity_nid, None);

        let impact = Message::ShotImpact {
            shooter_nid,
            target_nid,
            from_x: 0.0,
            from_y: 0.0,
            hit_x: 200.0,
            hit_y: 0.0,
        };
        let shooter_frames = drain(&server, &mut shooter_rx);
        assert_eq!(messages(&shooter_frames), vec![impact.clone()]);
        assert!(shooter_frames.iter().any(|f| f.deletes().any(|&n| n == target_nid)));
        assert_eq!(messages(&drain(&server, &mut target_rx)), vec![impact]);

        // Dead players rejoin with the same name and the recycled nid
        send(&mut server, target, vec![username("BBB")]);
        let report = clock.tick(&mut server);
        assert_eq!(report.spawned, vec![target_nid]);
    }

    #[tokio::test]
    async fn shot_from_spectator_is_dropped() {
        let mut server = Server::new(config()).unwrap();
        let mut clock = Clock::new();
        let (spectator, mut rx) = accepted(&mut server).await;

        send(&mut server, spectator, vec![shot(50.0, 10.0, 0)]);
        let report = clock.tick(&mut server);
        assert_eq!(report.dropped_commands, 1);
        assert!(messages(&drain(&server, &mut rx)).is_empty());
    }

    #[tokio::test]
    async fn miss_is_still_announced() {
        let mut server = Server::new(config()).unwrap();
        let mut clock = Clock::new();
        let (shooter, mut rx) = accepted(&mut server).await;
        send(&mut server, shooter, vec![username("AAA")]);
        clock.tick(&mut server);
        let nid = server.sessions().get(shooter).unwrap().entity_nid.unwrap();
        server.game_mut().place_entity(nid, 0.0, 0.0);
        clock.tick(&mut server);
        drain(&server, &mut rx);

        send(&mut server, shooter, vec![shot(300.0, 40.0, 0)]);
        let report = clock.tick(&mut server);
        assert!(report.hits.is_empty());
        assert!(matches!(
            messages(&drain(&server, &mut rx))[..],
            [Message::ShotImpact { target_nid: 0, .. }]
        ));
    }
}

mod replication_tests {
    use super::*;

    fn apply_all(mirror: &mut Mirror, frames: &[Frame]) {
        for frame in frames {
            mirror.apply(frame);
        }
    }

    /// The mirror must hold exactly the entities whose position lies in the
    /// session's view, with the server's field values.
    fn assert_converged(server: &Server, conn_id: ConnectionId, mirror: &Mirror) {
        let view = server.sessions().get(conn_id).unwrap().view;
        let expected: Vec<u16> = server
            .game()
            .entities()
            .filter(|e| view.contains_point(e.x, e.y))
            .map(|e| e.nid)
            .collect();
        assert_eq!(mirror.nids(), expected);
        for nid in expected {
            let entity = server.game().entity(nid).unwrap();
            assert_eq!(mirror.entity(nid), Some(&entity.to_record()));
        }
    }

    #[tokio::test]
    async fn mirror_converges_with_interest_set() {
        let mut server = Server::new(ServerConfig {
            obstacles: 12,
            props: 12,
            ..config()
        })
        .unwrap();
        let mut clock = Clock::new();
        let (watcher, mut rx) = accepted(&mut server).await;
        let (mover, _mover_rx) = accepted(&mut server).await;
        send(&mut server, mover, vec![username("mover")]);
        clock.tick(&mut server);
        let nid = server.sessions().get(mover).unwrap().entity_nid.unwrap();

        let mut mirror = Mirror::new();
        let stops = [(0.0, 0.0), (900.0, 0.0), (100.0, 200.0), (-950.0, -950.0), (0.0, 0.0)];
        for (x, y) in stops {
            server.game_mut().place_entity(nid, x, y);
            clock.tick(&mut server);
            apply_all(&mut mirror, &drain(&server, &mut rx));
            assert_converged(&server, watcher, &mirror);
        }
    }

    #[tokio::test]
    async fn client_prediction_is_confirmed_by_server() {
        let mut server = Server::new(config()).unwrap();
        let mut clock = Clock::new();
        let (conn_id, mut rx) = accepted(&mut server).await;

        let mut game = ClientGame::new();
        for frame in drain(&server, &mut rx) {
            assert!(game.handle_frame(&frame).accepted);
        }
        game.input.join("AAA");

        let dt = 1.0 / server.config().tick_rate as f32;
        let intent = Intent {
            right: true,
            ..Default::default()
        };
        let mut outcomes = Vec::new();
        for _ in 0..5 {
            let frame = game.tick(&intent, dt);
            let bytes = encode_frame(server.registry(), &frame).unwrap();
            server.handle_event(NetworkEvent::Packet { conn_id, bytes });
            clock.tick(&mut server);
            for frame in drain(&server, &mut rx) {
                outcomes.push(game.handle_frame(&frame).reconciliation);
            }
        }

        let nid = game.mirror.my_id().unwrap();
        assert_eq!(Some(nid), server.sessions().get(conn_id).unwrap().entity_nid);
        let reconciled: Vec<_> = outcomes.into_iter().flatten().collect();
        assert_eq!(reconciled.len(), 4);
        assert!(reconciled.iter().all(|r| *r == Reconciliation::Confirmed));
        assert_eq!(game.predictor.corrections(), 0);
        assert!(game.predictor.is_empty());
    }

    #[tokio::test]
    async fn server_override_corrects_client() {
        let mut server = Server::new(config()).unwrap();
        let mut clock = Clock::new();
        let (conn_id, mut rx) = accepted(&mut server).await;

        let mut game = ClientGame::new();
        for frame in drain(&server, &mut rx) {
            game.handle_frame(&frame);
        }
        game.input.join("AAA");
        let dt = 1.0 / server.config().tick_rate as f32;
        let intent = Intent {
            down: true,
            ..Default::default()
        };

        let mut step = |game: &mut ClientGame, server: &mut Server| {
            let frame = game.tick(&intent, dt);
            let bytes = encode_frame(server.registry(), &frame).unwrap();
            server.handle_event(NetworkEvent::Packet { conn_id, bytes });
            let report = clock.tick(server);
            let mut last = None;
            for frame in drain(server, &mut rx) {
                last = game.handle_frame(&frame).reconciliation.or(last);
            }
            (report, last)
        };

        step(&mut game, &mut server);
        step(&mut game, &mut server);

        // Server teleports the entity; the next confirmation must take it
        let nid = game.mirror.my_id().unwrap();
        server.game_mut().place_entity(nid, -300.0, 40.0);
        let (_, result) = step(&mut game, &mut server);
        assert!(matches!(result, Some(Reconciliation::Corrected { .. })));

        let (x, y) = game.position().unwrap();
        let entity = server.game().entity(nid).unwrap();
        assert_eq!((x, y), (entity.x, entity.y));
        assert_eq!(game.predictor.corrections(), 1);
    }

    /// Plays one client tick against the server and feeds back what it sent.
    fn lockstep(
        game: &mut ClientGame,
        server: &mut Server,
        clock: &mut Clock,
        conn_id: ConnectionId,
        rx: &mut mpsc::UnboundedReceiver<Outbound>,
        intent: &Intent,
    ) -> Vec<client::game::FrameOutcome> {
        let dt = 1.0 / server.config().tick_rate as f32;
        let frame = game.tick(intent, dt);
        let bytes = encode_frame(server.registry(), &frame).unwrap();
        server.handle_event(NetworkEvent::Packet { conn_id, bytes });
        clock.tick(server);
        drain(server, rx)
            .iter()
            .map(|frame| game.handle_frame(frame))
            .collect()
    }

    #[tokio::test]
    async fn obstacle_blocked_prediction_follows_server() {
        let mut server = Server::new(config()).unwrap();
        let mut clock = Clock::new();
        let (conn_id, mut rx) = accepted(&mut server).await;

        let mut game = ClientGame::new();
        for frame in drain(&server, &mut rx) {
            game.handle_frame(&frame);
        }
        game.input.join("AAA");
        let idle = Intent::default();
        for _ in 0..2 {
            lockstep(&mut game, &mut server, &mut clock, conn_id, &mut rx, &idle);
        }
        let nid = game.mirror.my_id().unwrap();

        server.game_mut().place_entity(nid, 0.0, 0.0);
        server.game_mut().spawn_obstacle(40.0, 0.0, 20.0, 200.0).unwrap();

        let right = Intent {
            right: true,
            ..Default::default()
        };
        let mut corrected = 0;
        for _ in 0..30 {
            let outcomes = lockstep(&mut game, &mut server, &mut clock, conn_id, &mut rx, &right);
            for outcome in outcomes {
                let Some(result) = outcome.reconciliation else {
                    continue;
                };
                if matches!(result, Reconciliation::Corrected { .. }) {
                    corrected += 1;
                }
                let (x, y) = game.position().unwrap();
                let entity = server.game().entity(nid).unwrap();
                assert_approx_eq!(x, entity.x, 0.01);
                assert_approx_eq!(y, entity.y, 0.01);
            }
        }

        let entity = server.game().entity(nid).unwrap();
        assert!(entity.x <= 14.5, "walked into the obstacle: x = {}", entity.x);
        assert!(corrected > 0);
        let (x, _) = game.position().unwrap();
        assert_approx_eq!(x, entity.x, 0.01);
    }

    #[tokio::test]
    async fn echo_request_gets_its_response() {
        let mut server = Server::new(config()).unwrap();
        let mut clock = Clock::new();
        let (conn_id, mut rx) = accepted(&mut server).await;

        let mut game = ClientGame::new();
        for frame in drain(&server, &mut rx) {
            game.handle_frame(&frame);
        }
        let id = game.request(endpoints::ECHO, "[1,2]");

        let outcomes = lockstep(
            &mut game,
            &mut server,
            &mut clock,
            conn_id,
            &mut rx,
            &Intent::default(),
        );
        let responses: Vec<_> = outcomes.into_iter().flat_map(|o| o.responses).collect();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].request_id, id);
        assert_eq!(responses[0].body, "[1,2]");
        assert_eq!(game.pending_requests().count(), 0);
    }
}
