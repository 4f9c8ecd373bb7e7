//! End-to-end tests exercising the typed surface over the in-memory
//! engine: stores, indexes, transactions, change events, TTL, and
//! cross-context broadcast.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tessera_core::{
    ChangeKind, ChangeSource, Database, DbError, DbResult, IndexDefinition, Key, LocalBus,
    MemoryEngine, Schema, StoreDefinition,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct User {
    id: String,
    email: String,
    name: String,
}

fn user(id: &str, email: &str, name: &str) -> User {
    User {
        id: id.into(),
        email: email.into(),
        name: name.into(),
    }
}

fn user_schema() -> Schema {
    Schema::new().store(
        StoreDefinition::new("users")
            .key_path("id")
            .index(IndexDefinition::new("byEmail", "email").unique()),
    )
}

#[test]
fn users_by_email_scenario() {
    let db = Database::open_in_memory("app", user_schema());
    let users = db.store::<User>("users").unwrap();

    users
        .add(&user("u1", "alice@example.com", "Alice"))
        .unwrap();
    users.add(&user("u2", "bob@example.com", "Bob")).unwrap();

    // Unique index lookups resolve records and primary keys.
    let by_email = users.index("byEmail").unwrap();
    assert_eq!(by_email.resolve("bob@example.com").unwrap().id, "u2");
    assert_eq!(
        by_email.get_key("alice@example.com").unwrap(),
        Some(Key::text("u1"))
    );

    // A second user with a taken email is rejected and leaves no trace.
    let error = users
        .add(&user("u3", "alice@example.com", "Imposter"))
        .unwrap_err();
    assert_eq!(error.code(), tessera_core::ErrorCode::Constraint);
    assert_eq!(users.count(None).unwrap(), 2);

    // Rename keeps the index consistent.
    users
        .set(&user("u1", "alice@new.example.com", "Alice"))
        .unwrap();
    assert!(by_email.get("alice@example.com").unwrap().is_none());
    assert_eq!(by_email.resolve("alice@new.example.com").unwrap().id, "u1");
}

#[test]
fn multi_store_transaction_commits_atomically() {
    let schema = Schema::new()
        .store(StoreDefinition::new("users").key_path("id"))
        .store(StoreDefinition::new("audit").auto_increment());
    let db = Database::open_in_memory("app", schema);

    #[derive(Serialize, Deserialize)]
    struct Audit {
        action: String,
        subject: String,
    }

    db.write(&["users", "audit"], |txn| {
        let users = txn.store::<User>("users")?;
        let audit = txn.store::<Audit>("audit")?;
        users.set(&user("u1", "a@example.com", "Alice"))?;
        audit.set(&Audit {
            action: "created".into(),
            subject: "u1".into(),
        })?;
        Ok(())
    })
    .unwrap();

    let users = db.store::<User>("users").unwrap();
    let audit = db.store::<serde_json::Value>("audit").unwrap();
    assert_eq!(users.count(None).unwrap(), 1);
    assert_eq!(audit.count(None).unwrap(), 1);

    // A failing body rolls back every store in the scope.
    let result: DbResult<()> = db.write(&["users", "audit"], |txn| {
        let users = txn.store::<User>("users")?;
        users.set(&user("u2", "b@example.com", "Bob"))?;
        Err(DbError::data("validation failed"))
    });
    assert!(result.is_err());
    assert_eq!(users.count(None).unwrap(), 1);
}

#[test]
fn events_fire_after_commit_only() {
    let db = Database::open_in_memory("app", user_schema());
    let events = Arc::new(Mutex::new(Vec::new()));
    let events_in = Arc::clone(&events);
    let _sub = db.on_change(move |event| events_in.lock().push(event.clone()));

    let observed_mid_txn = Arc::new(Mutex::new(None));
    let observed_in = Arc::clone(&observed_mid_txn);
    let events_probe = Arc::clone(&events);
    db.write(&["users"], |txn| {
        let users = txn.store::<User>("users")?;
        users.set(&user("u1", "a@example.com", "Alice"))?;
        *observed_in.lock() = Some(events_probe.lock().len());
        Ok(())
    })
    .unwrap();

    assert_eq!(*observed_mid_txn.lock(), Some(0));
    let events = events.lock();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, ChangeKind::Set);
    assert_eq!(events[0].source, ChangeSource::Local);
}

#[test]
fn aborted_transaction_emits_nothing() {
    let db = Database::open_in_memory("app", user_schema());
    let fired = Arc::new(Mutex::new(0_u32));
    let fired_in = Arc::clone(&fired);
    let _sub = db.on_change(move |_| *fired_in.lock() += 1);

    let _ = db.write(&["users"], |txn| {
        let users = txn.store::<User>("users")?;
        users.set(&user("u1", "a@example.com", "Alice"))?;
        txn.abort();
        Ok(())
    });
    assert_eq!(*fired.lock(), 0);

    let users = db.store::<User>("users").unwrap();
    assert_eq!(users.count(None).unwrap(), 0);
}

#[test]
fn bus_replays_remote_events_without_echo() {
    let bus: Arc<LocalBus> = Arc::new(LocalBus::new());
    let schema = user_schema();

    // Two handles sharing one engine, as two contexts of the same app.
    let engine = Arc::new(MemoryEngine::new(schema));
    let db_a = Database::open_with_bus("app", engine.clone(), bus.clone());
    let db_b = Database::open_with_bus("app", engine, bus.clone());

    let seen_a = Arc::new(Mutex::new(Vec::new()));
    let seen_b = Arc::new(Mutex::new(Vec::new()));
    let seen_a_in = Arc::clone(&seen_a);
    let seen_b_in = Arc::clone(&seen_b);
    let _sub_a = db_a.on_change(move |event| seen_a_in.lock().push(event.clone()));
    let _sub_b = db_b.on_change(move |event| seen_b_in.lock().push(event.clone()));

    let users = db_a.store::<User>("users").unwrap();
    users.set(&user("u1", "a@example.com", "Alice")).unwrap();

    // The writer sees its own event exactly once, tagged local.
    let seen_a = seen_a.lock();
    assert_eq!(seen_a.len(), 1);
    assert_eq!(seen_a[0].source, ChangeSource::Local);

    // The peer sees it once, tagged remote, with the same payload.
    let seen_b = seen_b.lock();
    assert_eq!(seen_b.len(), 1);
    assert_eq!(seen_b[0].source, ChangeSource::Remote);
    assert_eq!(seen_b[0].store, "users");
    assert_eq!(seen_b[0].keys, vec![Key::text("u1")]);
}

#[test]
fn closed_database_stops_listening_to_the_bus() {
    let bus: Arc<LocalBus> = Arc::new(LocalBus::new());
    let engine = Arc::new(MemoryEngine::new(user_schema()));
    let db_a = Database::open_with_bus("app", engine.clone(), bus.clone());
    let db_b = Database::open_with_bus("app", engine, bus);

    let fired = Arc::new(Mutex::new(0_u32));
    let fired_in = Arc::clone(&fired);
    let _sub = db_b.on_change(move |_| *fired_in.lock() += 1);
    db_b.close();

    let users = db_a.store::<User>("users").unwrap();
    users.set(&user("u1", "a@example.com", "Alice")).unwrap();
    assert_eq!(*fired.lock(), 0);
}

#[test]
fn ttl_lifecycle_filter_then_prune() {
    #[derive(Debug, Serialize, Deserialize)]
    struct Session {
        id: String,
        token: String,
        #[serde(rename = "_expiresAt")]
        expires_at: u64,
    }

    let schema = Schema::new().store(StoreDefinition::new("sessions").key_path("id").ttl());
    let db = Database::open_in_memory("app", schema);
    let sessions = db.store::<Session>("sessions").unwrap();

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64;
    sessions
        .set(&Session {
            id: "s1".into(),
            token: "live".into(),
            expires_at: now + 3_600_000,
        })
        .unwrap();
    sessions
        .set(&Session {
            id: "s2".into(),
            token: "stale".into(),
            expires_at: now.saturating_sub(10),
        })
        .unwrap();

    // Reads filter; physical presence is unchanged.
    assert!(sessions.get("s2").unwrap().is_none());
    assert!(sessions.has("s2").unwrap());
    assert_eq!(sessions.all(None, None).unwrap().len(), 1);
    assert_eq!(sessions.count(None).unwrap(), 2);

    let removals = Arc::new(Mutex::new(Vec::new()));
    let removals_in = Arc::clone(&removals);
    let _sub = sessions.on_change(move |event| {
        if event.kind == ChangeKind::Remove {
            removals_in.lock().extend(event.keys.clone());
        }
    });

    let stats = sessions.prune().unwrap();
    assert_eq!(stats.pruned, 1);
    assert_eq!(stats.remaining, 1);
    assert_eq!(removals.lock().as_slice(), [Key::text("s2")]);

    // Pruning again is a no-op.
    let stats = sessions.prune().unwrap();
    assert_eq!(stats.pruned, 0);
    assert_eq!(stats.remaining, 1);
}

#[test]
fn listener_panic_is_isolated_and_reported() {
    let db = Database::open_in_memory("app", user_schema());
    let reports = Arc::new(Mutex::new(Vec::new()));
    let reports_in = Arc::clone(&reports);
    let _err_sub = db.on_listener_error(move |report| {
        reports_in.lock().push(report.message.clone());
    });

    let _bad = db.on_change(|_| panic!("listener bug"));
    let survived = Arc::new(Mutex::new(0_u32));
    let survived_in = Arc::clone(&survived);
    let _good = db.on_change(move |_| *survived_in.lock() += 1);

    let users = db.store::<User>("users").unwrap();
    users.set(&user("u1", "a@example.com", "Alice")).unwrap();

    assert_eq!(*survived.lock(), 1);
    let reports = reports.lock();
    assert_eq!(reports.len(), 1);
    assert!(reports[0].contains("listener bug"));
}

mod properties {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn records_round_trip(
            id in "[a-z]{1,8}",
            name in "[a-zA-Z ]{0,16}",
        ) {
            let db = Database::open_in_memory("app", user_schema());
            let users = db.store::<User>("users").unwrap();
            let record = user(&id, &format!("{id}@example.com"), &name);
            users.set(&record).unwrap();
            prop_assert_eq!(users.resolve(id.as_str()).unwrap(), record);
        }

        #[test]
        fn keys_stay_sorted_regardless_of_insertion_order(
            ids in proptest::collection::hash_set("[a-z]{1,6}", 0..20),
        ) {
            let db = Database::open_in_memory("app", user_schema());
            let users = db.store::<User>("users").unwrap();
            for id in &ids {
                users
                    .set(&user(id, &format!("{id}@example.com"), "x"))
                    .unwrap();
            }
            let keys = users.keys(None, None).unwrap();
            prop_assert_eq!(keys.len(), ids.len());
            prop_assert!(keys.windows(2).all(|pair| pair[0] < pair[1]));
        }
    }
}

#[test]
fn unsubscribed_listener_stays_silent() {
    let db = Database::open_in_memory("app", user_schema());
    let fired = Arc::new(Mutex::new(0_u32));
    let fired_in = Arc::clone(&fired);
    let mut sub = db.on_change(move |_| *fired_in.lock() += 1);

    let users = db.store::<User>("users").unwrap();
    users.set(&user("u1", "a@example.com", "Alice")).unwrap();
    sub.unsubscribe();
    users.set(&user("u2", "b@example.com", "Bob")).unwrap();

    assert_eq!(*fired.lock(), 1);
}
