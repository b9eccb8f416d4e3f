use criterion::{black_box, criterion_group, criterion_main, Criterion};
use hozo_collab::broadcast::SessionRoom;
use hozo_collab::presence::{assign_color, PresenceEvent, PresenceTable, UserPresence};
use hozo_collab::protocol::{ClientMessage, ServerMessage, UserInfo};
use hozo_collab::session::SessionId;
use hozo_collab::OfflineQueue;
use hozo_core::{Concept, OntologyDocument, Operation, Point};
use uuid::Uuid;

fn user(i: usize) -> UserInfo {
    let user_id = Uuid::new_v4();
    UserInfo {
        user_id,
        user_name: format!("User{i}"),
        color: assign_color(&user_id),
    }
}

fn document(concepts: usize) -> OntologyDocument {
    let mut doc = OntologyDocument::new("bench.xml", "bench");
    for i in 0..concepts {
        doc.concepts
            .push(Concept::new(format!("c{i}"), format!("Concept {i}"), Point::ORIGIN));
    }
    doc
}

// ─── Protocol ───────────────────────────────────────────────────

fn bench_operation_encode(c: &mut Criterion) {
    let msg = ServerMessage::Operation {
        operation: Operation::move_concept("c1", Point::new(150.0, 250.0)),
    };

    c.bench_function("operation_frame_encode", |b| {
        b.iter(|| black_box(black_box(&msg).encode().unwrap()))
    });
}

fn bench_operation_decode(c: &mut Criterion) {
    let encoded = ClientMessage::Operation {
        operation: Operation::move_concept("c1", Point::new(150.0, 250.0)),
    }
    .encode()
    .unwrap();

    c.bench_function("operation_frame_decode", |b| {
        b.iter(|| black_box(ClientMessage::decode(black_box(&encoded)).unwrap()))
    });
}

fn bench_joined_encode_1k_concepts(c: &mut Criterion) {
    let users: Vec<UserInfo> = (0..10).map(user).collect();
    let msg = ServerMessage::Joined {
        user_id: users[0].user_id,
        color: users[0].color.clone(),
        ontology: document(1_000),
        users,
    };

    c.bench_function("joined_frame_encode_1k_concepts", |b| {
        b.iter(|| black_box(msg.encode().unwrap()))
    });
}

// ─── Presence ───────────────────────────────────────────────────

fn bench_assign_color(c: &mut Criterion) {
    let id = Uuid::new_v4();

    c.bench_function("assign_color", |b| {
        b.iter(|| black_box(assign_color(black_box(&id))))
    });
}

fn bench_presence_cursor_event(c: &mut Criterion) {
    let local = Uuid::new_v4();
    let remote = Uuid::new_v4();
    let mut table = PresenceTable::new();
    table.reset(
        UserPresence::new(local, "Local", "#000000"),
        [UserPresence::new(remote, "Remote", "#ffffff")],
    );
    let event = PresenceEvent::Cursor {
        user_id: remote,
        name: "Remote".into(),
        color: "#ffffff".into(),
        cursor: Point::new(10.0, 20.0),
    };

    c.bench_function("presence_handle_cursor", |b| {
        b.iter(|| black_box(table.handle_event(black_box(&event))))
    });
}

fn bench_presence_snapshot_100_users(c: &mut Criterion) {
    let local = Uuid::new_v4();
    let users: Vec<UserPresence> = (0..100)
        .map(|i| UserPresence::from(user(i)))
        .collect();
    let event = PresenceEvent::Snapshot(users);

    c.bench_function("presence_snapshot_100_users", |b| {
        b.iter(|| {
            let mut table = PresenceTable::new();
            table.reset(UserPresence::new(local, "Local", "#000000"), []);
            black_box(table.handle_event(&event));
        })
    });
}

// ─── Fan-out ────────────────────────────────────────────────────

fn bench_room_apply_100_users(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("room_apply_100_users", |b| {
        b.iter(|| {
            rt.block_on(async {
                let room = SessionRoom::new(SessionId::new("bench"), document(100), 1024);

                let mut receivers = Vec::new();
                let mut sender = None;
                for i in 0..100 {
                    let info = user(i);
                    sender.get_or_insert(info.user_id);
                    receivers.push(room.admit(info, 200).await.unwrap().receiver);
                }

                let from = sender.unwrap();
                let op = Operation::move_concept("c1", Point::new(1.0, 2.0));
                black_box(room.apply(from, black_box(op)).await.unwrap());
            });
        })
    });
}

fn bench_room_1000_operations(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("room_1000_ops_10_users", |b| {
        b.iter(|| {
            rt.block_on(async {
                let room = SessionRoom::new(SessionId::new("bench"), document(100), 2048);
                let mut receivers = Vec::new();
                let from = Uuid::new_v4();
                for i in 0..10 {
                    receivers.push(room.admit(user(i), 20).await.unwrap().receiver);
                }

                for i in 0..1000u64 {
                    let op = Operation::move_concept(
                        format!("c{}", i % 100),
                        Point::new(i as f64, i as f64),
                    );
                    room.apply(from, black_box(op)).await.unwrap();
                }
            });
        })
    });
}

fn bench_offline_queue(c: &mut Criterion) {
    c.bench_function("offline_queue_1000_ops", |b| {
        b.iter(|| {
            let mut queue = OfflineQueue::new(10_000);
            for i in 0..1000u64 {
                queue.enqueue(Operation::rename_concept(format!("c{i}"), "Renamed"));
            }
            black_box(queue.drain());
        })
    });
}

criterion_group!(
    benches,
    bench_operation_encode,
    bench_operation_decode,
    bench_joined_encode_1k_concepts,
    bench_assign_color,
    bench_presence_cursor_event,
    bench_presence_snapshot_100_users,
    bench_room_apply_100_users,
    bench_room_1000_operations,
    bench_offline_queue,
);
criterion_main!(benches);
