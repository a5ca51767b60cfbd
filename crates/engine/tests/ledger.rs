use sea_orm::{Database, DatabaseConnection};

use engine::{AccountRef, Engine, EngineError, RecordCmd, TransactionKind, TxMeta};
use migration::MigratorTrait;

async fn engine_with_db() -> (Engine, DatabaseConnection) {
    let db = Database::connect("sqlite::memory:").await.unwrap();
    migration::Migrator::up(&db, None).await.unwrap();
    let engine = Engine::builder()
        .database(db.clone())
        .build()
        .await
        .unwrap();
    (engine, db)
}

fn keyed(key: &str) -> TxMeta {
    TxMeta::new().idempotency_key(key)
}

#[tokio::test]
async fn earn_then_redeem_moves_balances() {
    let (engine, _db) = engine_with_db().await;

    engine
        .record_earn("alice", 1_000, TxMeta::new())
        .await
        .unwrap();
    let redeem = engine
        .record_redeem("alice", "coffee-bar", 350, TxMeta::new())
        .await
        .unwrap();

    assert_eq!(redeem.kind, TransactionKind::DriverRedeem);
    assert_eq!(redeem.source.as_deref(), Some("driver:alice"));
    assert_eq!(redeem.destination.as_deref(), Some("merchant:coffee-bar"));
    assert_eq!(
        engine.get_balance(&AccountRef::driver("alice")).await.unwrap(),
        650
    );
    assert_eq!(
        engine
            .get_balance(&AccountRef::merchant("coffee-bar"))
            .await
            .unwrap(),
        350
    );
}

#[tokio::test]
async fn unknown_account_reads_zero_but_is_not_found() {
    let (engine, _db) = engine_with_db().await;
    let ghost = AccountRef::driver("ghost");

    assert_eq!(engine.get_balance(&ghost).await.unwrap(), 0);
    assert!(matches!(
        engine.account(&ghost).await.unwrap_err(),
        EngineError::KeyNotFound(_)
    ));

    let created = engine.get_or_create_account(&ghost).await.unwrap();
    assert_eq!(created.balance_cents, 0);
    assert_eq!(created.id, "driver:ghost");
    assert_eq!(engine.account(&ghost).await.unwrap(), created);
}

#[tokio::test]
async fn replay_with_same_key_returns_first_transaction() {
    let (engine, _db) = engine_with_db().await;

    let first = engine
        .record_earn("alice", 500, keyed("earn-1").correlation_id("trip-9"))
        .await
        .unwrap();
    let second = engine
        .record_earn("alice", 500, keyed("earn-1").correlation_id("trip-9"))
        .await
        .unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(
        engine.get_balance(&AccountRef::driver("alice")).await.unwrap(),
        500
    );
    let history = engine
        .list_account_transactions(&AccountRef::driver("alice"), 10)
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
}

#[tokio::test]
async fn reused_key_with_other_payload_conflicts() {
    let (engine, _db) = engine_with_db().await;

    engine
        .record_earn("alice", 500, keyed("earn-1"))
        .await
        .unwrap();

    let err = engine
        .record_earn("alice", 600, keyed("earn-1"))
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::IdempotencyConflict("earn-1".to_string()));

    let err = engine
        .record_earn("bob", 500, keyed("earn-1"))
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::IdempotencyConflict("earn-1".to_string()));

    assert_eq!(
        engine.get_balance(&AccountRef::driver("alice")).await.unwrap(),
        500
    );
    assert_eq!(engine.get_balance(&AccountRef::driver("bob")).await.unwrap(), 0);
}

#[tokio::test]
async fn keys_are_scoped_by_kind() {
    let (engine, _db) = engine_with_db().await;

    let earn = engine
        .record_earn("alice", 500, keyed("shared"))
        .await
        .unwrap();
    let topup = engine
        .record_merchant_topup("coffee-bar", 2_000, keyed("shared"))
        .await
        .unwrap();

    assert_ne!(earn.id, topup.id);
    assert_eq!(
        engine
            .get_balance(&AccountRef::merchant("coffee-bar"))
            .await
            .unwrap(),
        2_000
    );
}

#[tokio::test]
async fn invalid_commands_are_rejected_before_writing() {
    let (engine, _db) = engine_with_db().await;

    let err = engine
        .record_earn("alice", 0, TxMeta::new())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidAmount(_)));

    let err = engine
        .record_earn("alice", -10, TxMeta::new())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidAmount(_)));

    // A redeem needs both a driver source and a merchant destination.
    let err = engine
        .record(
            RecordCmd::new(TransactionKind::DriverRedeem, 100)
                .source(AccountRef::driver("alice")),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidAmount(_)));

    let err = engine
        .record(
            RecordCmd::new(TransactionKind::DriverEarn, 100)
                .destination(AccountRef::merchant("coffee-bar")),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidAmount(_)));

    assert!(
        engine
            .list_account_transactions(&AccountRef::driver("alice"), 10)
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn redeem_above_balance_fails_without_side_effects() {
    let (engine, _db) = engine_with_db().await;

    engine
        .record_earn("alice", 300, TxMeta::new())
        .await
        .unwrap();
    let err = engine
        .record_redeem("alice", "coffee-bar", 301, keyed("redeem-1"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InsufficientBalance(_)));

    assert_eq!(
        engine.get_balance(&AccountRef::driver("alice")).await.unwrap(),
        300
    );
    assert_eq!(
        engine
            .get_balance(&AccountRef::merchant("coffee-bar"))
            .await
            .unwrap(),
        0
    );

    // The failed attempt did not burn the key.
    engine
        .record_redeem("alice", "coffee-bar", 300, keyed("redeem-1"))
        .await
        .unwrap();
    assert_eq!(
        engine.get_balance(&AccountRef::driver("alice")).await.unwrap(),
        0
    );
}

#[tokio::test]
async fn concurrent_redeems_never_overdraw() {
    let (engine, _db) = engine_with_db().await;
    engine
        .record_earn("alice", 1_000, TxMeta::new())
        .await
        .unwrap();

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..10 {
        let engine = engine.clone();
        tasks.spawn(async move {
            engine
                .record_redeem("alice", "coffee-bar", 300, TxMeta::new())
                .await
        });
    }

    let mut succeeded = 0;
    while let Some(result) = tasks.join_next().await {
        match result.unwrap() {
            Ok(_) => succeeded += 1,
            Err(err) => assert!(matches!(err, EngineError::InsufficientBalance(_))),
        }
    }

    assert_eq!(succeeded, 3);
    assert_eq!(
        engine.get_balance(&AccountRef::driver("alice")).await.unwrap(),
        100
    );
    assert_eq!(
        engine
            .get_balance(&AccountRef::merchant("coffee-bar"))
            .await
            .unwrap(),
        900
    );
}

#[tokio::test]
async fn concurrent_replays_persist_one_transaction() {
    let (engine, _db) = engine_with_db().await;

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..5 {
        let engine = engine.clone();
        tasks.spawn(async move { engine.record_admin_grant("alice", 250, keyed("bonus")).await });
    }

    let mut ids = Vec::new();
    while let Some(result) = tasks.join_next().await {
        ids.push(result.unwrap().unwrap().id);
    }
    ids.dedup();
    assert_eq!(ids.len(), 1);
    assert_eq!(
        engine.get_balance(&AccountRef::driver("alice")).await.unwrap(),
        250
    );
}

#[tokio::test]
async fn history_replays_to_stored_balance() {
    let (engine, _db) = engine_with_db().await;
    let alice = AccountRef::driver("alice");
    let bar = AccountRef::merchant("coffee-bar");

    engine
        .record_earn("alice", 1_200, TxMeta::new())
        .await
        .unwrap();
    engine
        .record_admin_grant(
            "alice",
            300,
            TxMeta::new().metadata(serde_json::json!({"note": "apology"})),
        )
        .await
        .unwrap();
    engine
        .record_redeem("alice", "coffee-bar", 700, TxMeta::new())
        .await
        .unwrap();
    engine
        .record_merchant_earn("coffee-bar", 50, TxMeta::new())
        .await
        .unwrap();

    let report = engine.reconcile_account(&alice).await.unwrap();
    assert!(report.is_consistent());
    assert_eq!(report.stored, 800);

    let report = engine.reconcile_account(&bar).await.unwrap();
    assert!(report.is_consistent());
    assert_eq!(report.derived, 750);

    let history = engine.list_account_transactions(&alice, 2).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].kind, TransactionKind::DriverRedeem);

    let fetched = engine.transaction(history[1].id).await.unwrap();
    assert_eq!(fetched, history[1]);
    assert_eq!(
        fetched.metadata,
        Some(serde_json::json!({"note": "apology"}))
    );
}
