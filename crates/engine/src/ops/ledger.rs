use chrono::{DateTime, Utc};
use sea_orm::{
    Condition, ConnectionTrait, QueryFilter, QueryOrder, QuerySelect, TransactionTrait,
    prelude::*,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    AccountKind, AccountRef, EngineError, RecordCmd, ResultEngine, Transaction, TransactionKind,
    TxMeta, fingerprint, transactions,
    util::{ensure_positive, is_unique_violation, normalize_optional_text},
};

use super::{Engine, accounts, with_tx};

/// Stored balance next to the one replayed from the transaction history.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reconciliation {
    pub account_id: String,
    pub stored: i64,
    pub derived: i64,
}

impl Reconciliation {
    pub fn is_consistent(&self) -> bool {
        self.stored == self.derived
    }
}

/// A validated ledger write, ready to be applied.
#[derive(Clone, Debug)]
struct Entry {
    source: Option<AccountRef>,
    destination: Option<AccountRef>,
    tx: Transaction,
}

fn check_side(
    kind: TransactionKind,
    label: &str,
    expected: Option<AccountKind>,
    actual: Option<&AccountRef>,
) -> ResultEngine<()> {
    match (expected, actual) {
        (None, None) => Ok(()),
        (Some(expected), Some(account)) if account.kind == expected => {
            if account.owner.trim().is_empty() {
                return Err(EngineError::InvalidAmount(format!(
                    "{label} owner must not be empty"
                )));
            }
            Ok(())
        }
        (Some(expected), _) => Err(EngineError::InvalidAmount(format!(
            "{} requires a {} {label}",
            kind.as_str(),
            expected.as_str()
        ))),
        (None, Some(_)) => Err(EngineError::InvalidAmount(format!(
            "{} takes no {label}",
            kind.as_str()
        ))),
    }
}

impl Entry {
    fn prepare(cmd: RecordCmd, now: DateTime<Utc>) -> ResultEngine<Self> {
        ensure_positive(cmd.amount_cents, "amount_cents")?;
        let sides = cmd.kind.sides();
        check_side(cmd.kind, "source", sides.debit, cmd.source.as_ref())?;
        check_side(cmd.kind, "destination", sides.credit, cmd.destination.as_ref())?;

        let source_id = cmd.source.as_ref().map(AccountRef::id);
        let destination_id = cmd.destination.as_ref().map(AccountRef::id);
        let idempotency_key = normalize_optional_text(cmd.meta.idempotency_key.as_deref());
        let correlation_id = normalize_optional_text(cmd.meta.correlation_id.as_deref());
        let payload_fingerprint = fingerprint(
            source_id.as_deref(),
            destination_id.as_deref(),
            cmd.amount_cents,
            cmd.kind,
            correlation_id.as_deref(),
        );

        Ok(Self {
            source: cmd.source,
            destination: cmd.destination,
            tx: Transaction {
                id: Uuid::new_v4(),
                kind: cmd.kind,
                amount_cents: cmd.amount_cents,
                source: source_id,
                destination: destination_id,
                idempotency_key,
                payload_fingerprint,
                correlation_id,
                created_at: now,
                metadata: cmd.meta.metadata,
            },
        })
    }
}

/// Look up an earlier write with the same `(kind, idempotency_key)`.
///
/// A matching fingerprint is a replay; anything else is a conflict.
async fn find_replay<C: ConnectionTrait>(
    conn: &C,
    entry: &Entry,
) -> ResultEngine<Option<Transaction>> {
    let Some(key) = entry.tx.idempotency_key.as_deref() else {
        return Ok(None);
    };
    let existing = transactions::Entity::find()
        .filter(transactions::Column::Kind.eq(entry.tx.kind.as_str()))
        .filter(transactions::Column::IdempotencyKey.eq(key))
        .one(conn)
        .await?;
    let Some(existing) = existing else {
        return Ok(None);
    };
    if existing.payload_fingerprint != entry.tx.payload_fingerprint {
        return Err(EngineError::IdempotencyConflict(key.to_string()));
    }
    Ok(Some(Transaction::try_from(existing)?))
}

/// Apply a ledger write on `conn`: replay check, balance mutations, then the
/// transaction row. The caller owns the database transaction.
async fn apply<C: ConnectionTrait>(conn: &C, entry: &Entry) -> ResultEngine<Transaction> {
    if let Some(existing) = find_replay(conn, entry).await? {
        tracing::debug!(
            "idempotent replay of {} {}",
            existing.kind.as_str(),
            existing.id
        );
        return Ok(existing);
    }
    write_entry(conn, entry).await
}

/// Balance mutations and the transaction row, without the replay check.
async fn write_entry<C: ConnectionTrait>(conn: &C, entry: &Entry) -> ResultEngine<Transaction> {
    let now = entry.tx.created_at;
    if let Some(source) = &entry.source {
        accounts::debit_if_sufficient(conn, source, entry.tx.amount_cents, now).await?;
    }
    if let Some(destination) = &entry.destination {
        accounts::credit(conn, destination, entry.tx.amount_cents, now).await?;
    }

    transactions::ActiveModel::try_from(&entry.tx)?
        .insert(conn)
        .await?;
    Ok(entry.tx.clone())
}

/// Record inside a caller-owned database transaction.
pub(super) async fn record_in_tx<C: ConnectionTrait>(
    conn: &C,
    cmd: RecordCmd,
    now: DateTime<Utc>,
) -> ResultEngine<Transaction> {
    let entry = Entry::prepare(cmd, now)?;
    apply(conn, &entry).await
}

impl Engine {
    /// Record a ledger transaction and apply it to the account balances.
    ///
    /// With an idempotency key, a second call with the same payload returns
    /// the first transaction unchanged; a different payload fails with
    /// `IdempotencyConflict`. A writer that loses the insert race on the key
    /// returns the winner's row.
    pub async fn record(&self, cmd: RecordCmd) -> ResultEngine<Transaction> {
        let entry = Entry::prepare(cmd, Utc::now())?;
        let result = with_tx!(self, |db_tx| apply(&db_tx, &entry).await);
        self.resolve_race(&entry, result).await
    }

    /// A write that lost the insert race on its key returns the winner.
    async fn resolve_race(
        &self,
        entry: &Entry,
        result: ResultEngine<Transaction>,
    ) -> ResultEngine<Transaction> {
        match result {
            Err(EngineError::Database(err)) if is_unique_violation(&err) => {
                match find_replay(&self.database, entry).await? {
                    Some(winner) => {
                        tracing::debug!(
                            "{} {} won the race on its key",
                            winner.kind.as_str(),
                            winner.id
                        );
                        Ok(winner)
                    }
                    None => Err(EngineError::Database(err)),
                }
            }
            Ok(tx) => {
                tracing::info!(
                    "recorded {} {} of {} cents",
                    tx.kind.as_str(),
                    tx.id,
                    tx.amount_cents
                );
                Ok(tx)
            }
            Err(err) => Err(err),
        }
    }

    /// Points earned by a driver.
    pub async fn record_earn(
        &self,
        driver_id: &str,
        amount_cents: i64,
        meta: TxMeta,
    ) -> ResultEngine<Transaction> {
        self.record(
            RecordCmd::new(TransactionKind::DriverEarn, amount_cents)
                .destination(AccountRef::driver(driver_id))
                .meta(meta),
        )
        .await
    }

    /// Points spent by a driver at a merchant.
    pub async fn record_redeem(
        &self,
        driver_id: &str,
        merchant_id: &str,
        amount_cents: i64,
        meta: TxMeta,
    ) -> ResultEngine<Transaction> {
        self.record(
            RecordCmd::new(TransactionKind::DriverRedeem, amount_cents)
                .source(AccountRef::driver(driver_id))
                .destination(AccountRef::merchant(merchant_id))
                .meta(meta),
        )
        .await
    }

    pub async fn record_merchant_topup(
        &self,
        merchant_id: &str,
        amount_cents: i64,
        meta: TxMeta,
    ) -> ResultEngine<Transaction> {
        self.record(
            RecordCmd::new(TransactionKind::MerchantTopup, amount_cents)
                .destination(AccountRef::merchant(merchant_id))
                .meta(meta),
        )
        .await
    }

    pub async fn record_admin_grant(
        &self,
        driver_id: &str,
        amount_cents: i64,
        meta: TxMeta,
    ) -> ResultEngine<Transaction> {
        self.record(
            RecordCmd::new(TransactionKind::AdminGrant, amount_cents)
                .destination(AccountRef::driver(driver_id))
                .meta(meta),
        )
        .await
    }

    pub async fn record_merchant_earn(
        &self,
        merchant_id: &str,
        amount_cents: i64,
        meta: TxMeta,
    ) -> ResultEngine<Transaction> {
        self.record(
            RecordCmd::new(TransactionKind::MerchantEarn, amount_cents)
                .destination(AccountRef::merchant(merchant_id))
                .meta(meta),
        )
        .await
    }

    /// Return a transaction by id.
    pub async fn transaction(&self, id: Uuid) -> ResultEngine<Transaction> {
        let model = transactions::Entity::find_by_id(id.to_string())
            .one(&self.database)
            .await?
            .ok_or_else(|| EngineError::KeyNotFound(format!("transaction {id} not exists")))?;
        Transaction::try_from(model)
    }

    /// Newest first.
    pub async fn list_account_transactions(
        &self,
        account: &AccountRef,
        limit: u64,
    ) -> ResultEngine<Vec<Transaction>> {
        let account_id = account.id();
        transactions::Entity::find()
            .filter(
                Condition::any()
                    .add(transactions::Column::SrcAccount.eq(account_id.clone()))
                    .add(transactions::Column::DstAccount.eq(account_id)),
            )
            .order_by_desc(transactions::Column::CreatedAt)
            .order_by_desc(transactions::Column::Id)
            .limit(limit)
            .all(&self.database)
            .await?
            .into_iter()
            .map(Transaction::try_from)
            .collect()
    }

    /// Replay the account's transaction history and compare it with the
    /// stored balance.
    pub async fn reconcile_account(&self, account: &AccountRef) -> ResultEngine<Reconciliation> {
        let account_id = account.id();
        with_tx!(self, |db_tx| {
            let stored = accounts::lock_account(&db_tx, account)
                .await?
                .map_or(0, |account| account.balance_cents);

            let history = transactions::Entity::find()
                .filter(
                    Condition::any()
                        .add(transactions::Column::SrcAccount.eq(account_id.clone()))
                        .add(transactions::Column::DstAccount.eq(account_id.clone())),
                )
                .all(&db_tx)
                .await?;
            let mut derived: i64 = 0;
            for model in history {
                let delta = Transaction::try_from(model)?.delta_for(&account_id);
                derived = derived.checked_add(delta).ok_or_else(|| {
                    EngineError::Corrupted(format!("balance of {account_id} overflows"))
                })?;
            }

            if stored != derived {
                tracing::warn!(
                    "account {account_id} drifted: stored {stored}, derived {derived}"
                );
            }
            Ok(Reconciliation {
                account_id: account_id.clone(),
                stored,
                derived,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use migration::MigratorTrait;
    use sea_orm::Database;

    use super::*;

    async fn engine_with_db() -> Engine {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        migration::Migrator::up(&db, None).await.unwrap();
        Engine::builder().database(db).build().await.unwrap()
    }

    fn redeem(key: &str) -> RecordCmd {
        RecordCmd::new(TransactionKind::DriverRedeem, 300)
            .source(AccountRef::driver("alice"))
            .destination(AccountRef::merchant("coffee-bar"))
            .idempotency_key(key)
    }

    #[tokio::test]
    async fn insert_race_loser_returns_winner() {
        let engine = engine_with_db().await;
        engine
            .record_earn("alice", 1_000, TxMeta::new())
            .await
            .unwrap();
        let winner = engine.record(redeem("redeem-1")).await.unwrap();

        // The loser passed its replay lookup before the winner committed.
        let loser = Entry::prepare(redeem("redeem-1"), Utc::now()).unwrap();
        let db_tx = engine.database.begin().await.unwrap();
        let result = write_entry(&db_tx, &loser).await;
        db_tx.rollback().await.unwrap();
        assert!(matches!(
            &result,
            Err(EngineError::Database(err)) if is_unique_violation(err)
        ));

        let resolved = engine.resolve_race(&loser, result).await.unwrap();
        assert_eq!(resolved.id, winner.id);
        assert_ne!(resolved.id, loser.tx.id);
        assert_eq!(
            engine.get_balance(&AccountRef::driver("alice")).await.unwrap(),
            700
        );
        assert_eq!(
            engine
                .get_balance(&AccountRef::merchant("coffee-bar"))
                .await
                .unwrap(),
            300
        );
        let history = engine
            .list_account_transactions(&AccountRef::driver("alice"), 10)
            .await
            .unwrap();
        assert_eq!(history.len(), 2);
    }

    #[tokio::test]
    async fn unkeyed_duplicate_is_not_swallowed() {
        let engine = engine_with_db().await;
        let entry = Entry::prepare(
            RecordCmd::new(TransactionKind::DriverEarn, 100).destination(AccountRef::driver("bob")),
            Utc::now(),
        )
        .unwrap();
        let db_tx = engine.database.begin().await.unwrap();
        write_entry(&db_tx, &entry).await.unwrap();
        let result = write_entry(&db_tx, &entry).await;
        db_tx.rollback().await.unwrap();

        let err = engine.resolve_race(&entry, result).await.unwrap_err();
        assert!(matches!(err, EngineError::Database(_)));
    }
}
