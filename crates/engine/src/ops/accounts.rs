use chrono::{DateTime, Utc};
use sea_orm::{
    ConnectionTrait, QueryFilter, QuerySelect, TransactionTrait,
    prelude::*,
    sea_query::{Expr, OnConflict},
};

use crate::{Account, AccountRef, EngineError, ResultEngine, accounts, util::ensure_positive};

use super::{Engine, with_tx};

impl Engine {
    /// Return the account, creating it with a zero balance on first use.
    pub async fn get_or_create_account(&self, account: &AccountRef) -> ResultEngine<Account> {
        let now = Utc::now();
        with_tx!(self, |db_tx| get_or_create(&db_tx, account, now).await)
    }

    /// Return an existing account.
    pub async fn account(&self, account: &AccountRef) -> ResultEngine<Account> {
        find_account(&self.database, account)
            .await?
            .ok_or_else(|| EngineError::KeyNotFound(format!("account {account} not exists")))
    }

    /// Current balance; an account never used reads as zero.
    pub async fn get_balance(&self, account: &AccountRef) -> ResultEngine<i64> {
        Ok(find_account(&self.database, account)
            .await?
            .map_or(0, |account| account.balance_cents))
    }
}

pub(super) async fn find_account<C: ConnectionTrait>(
    conn: &C,
    account: &AccountRef,
) -> ResultEngine<Option<Account>> {
    accounts::Entity::find_by_id(account.id())
        .one(conn)
        .await?
        .map(Account::try_from)
        .transpose()
}

/// Read an account row under an exclusive lock (where the backend has one).
pub(super) async fn lock_account<C: ConnectionTrait>(
    conn: &C,
    account: &AccountRef,
) -> ResultEngine<Option<Account>> {
    accounts::Entity::find_by_id(account.id())
        .lock_exclusive()
        .one(conn)
        .await?
        .map(Account::try_from)
        .transpose()
}

pub(super) async fn get_or_create<C: ConnectionTrait>(
    conn: &C,
    account: &AccountRef,
    now: DateTime<Utc>,
) -> ResultEngine<Account> {
    if let Some(existing) = find_account(conn, account).await? {
        return Ok(existing);
    }

    let model: accounts::ActiveModel = (&Account::new(account, now)).into();
    match accounts::Entity::insert(model)
        .on_conflict(
            OnConflict::column(accounts::Column::Id)
                .do_nothing()
                .to_owned(),
        )
        .exec_without_returning(conn)
        .await
    {
        Ok(_) | Err(DbErr::RecordNotInserted) => {}
        Err(err) => return Err(err.into()),
    }

    find_account(conn, account)
        .await?
        .ok_or_else(|| EngineError::KeyNotFound(format!("account {account} not exists")))
}

/// Unconditionally add `amount_cents` to the balance.
pub(super) async fn credit<C: ConnectionTrait>(
    conn: &C,
    account: &AccountRef,
    amount_cents: i64,
    now: DateTime<Utc>,
) -> ResultEngine<()> {
    ensure_positive(amount_cents, "amount_cents")?;
    get_or_create(conn, account, now).await?;
    accounts::Entity::update_many()
        .col_expr(
            accounts::Column::BalanceCents,
            Expr::col(accounts::Column::BalanceCents).add(amount_cents),
        )
        .col_expr(accounts::Column::UpdatedAt, Expr::value(now))
        .filter(accounts::Column::Id.eq(account.id()))
        .exec(conn)
        .await?;
    Ok(())
}

/// Subtract `amount_cents` iff the balance covers it, as one conditional
/// update. Zero affected rows means insufficient funds.
pub(super) async fn debit_if_sufficient<C: ConnectionTrait>(
    conn: &C,
    account: &AccountRef,
    amount_cents: i64,
    now: DateTime<Utc>,
) -> ResultEngine<()> {
    ensure_positive(amount_cents, "amount_cents")?;
    let result = accounts::Entity::update_many()
        .col_expr(
            accounts::Column::BalanceCents,
            Expr::col(accounts::Column::BalanceCents).sub(amount_cents),
        )
        .col_expr(accounts::Column::UpdatedAt, Expr::value(now))
        .filter(accounts::Column::Id.eq(account.id()))
        .filter(accounts::Column::BalanceCents.gte(amount_cents))
        .exec(conn)
        .await?;
    if result.rows_affected == 0 {
        return Err(EngineError::InsufficientBalance(account.id()));
    }
    Ok(())
}
