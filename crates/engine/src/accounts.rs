//! The module contains `Account` and its persistence model.
//!
//! An account is a balance-holding row: a driver wallet or a merchant
//! balance. Balances are integer cents and only change through the
//! conditional updates in `ops::accounts`.

use std::fmt;

use chrono::{DateTime, Utc};
use sea_orm::{ActiveValue, entity::prelude::*};
use serde::{Deserialize, Serialize};

use crate::EngineError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountKind {
    Driver,
    Merchant,
}

impl AccountKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Driver => "driver",
            Self::Merchant => "merchant",
        }
    }
}

impl TryFrom<&str> for AccountKind {
    type Error = EngineError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "driver" => Ok(Self::Driver),
            "merchant" => Ok(Self::Merchant),
            other => Err(EngineError::Corrupted(format!(
                "invalid account kind: {other}"
            ))),
        }
    }
}

/// Reference to an account by its owner.
///
/// The storage id is derived from kind and owner (`driver:<owner>`), so the
/// same owner always maps to the same row and accounts can be created
/// lazily on first use.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccountRef {
    pub kind: AccountKind,
    pub owner: String,
}

impl AccountRef {
    pub fn driver(owner: impl Into<String>) -> Self {
        Self {
            kind: AccountKind::Driver,
            owner: owner.into(),
        }
    }

    pub fn merchant(owner: impl Into<String>) -> Self {
        Self {
            kind: AccountKind::Merchant,
            owner: owner.into(),
        }
    }

    /// Storage id of the account.
    pub fn id(&self) -> String {
        format!("{}:{}", self.kind.as_str(), self.owner)
    }

    /// Parse a storage id back into a reference.
    pub fn parse(id: &str) -> Result<Self, EngineError> {
        let (kind, owner) = id
            .split_once(':')
            .ok_or_else(|| EngineError::InvalidId(format!("invalid account id: {id}")))?;
        if owner.is_empty() {
            return Err(EngineError::InvalidId(format!("invalid account id: {id}")));
        }
        Ok(Self {
            kind: AccountKind::try_from(kind)?,
            owner: owner.to_string(),
        })
    }
}

impl fmt::Display for AccountRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.owner)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub kind: AccountKind,
    pub owner_ref: String,
    pub balance_cents: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    pub fn new(account: &AccountRef, now: DateTime<Utc>) -> Self {
        Self {
            id: account.id(),
            kind: account.kind,
            owner_ref: account.owner.clone(),
            balance_cents: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn account_ref(&self) -> AccountRef {
        AccountRef {
            kind: self.kind,
            owner: self.owner_ref.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "accounts")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub kind: String,
    pub owner_ref: String,
    pub balance_cents: i64,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl From<&Account> for ActiveModel {
    fn from(account: &Account) -> Self {
        Self {
            id: ActiveValue::Set(account.id.clone()),
            kind: ActiveValue::Set(account.kind.as_str().to_string()),
            owner_ref: ActiveValue::Set(account.owner_ref.clone()),
            balance_cents: ActiveValue::Set(account.balance_cents),
            created_at: ActiveValue::Set(account.created_at),
            updated_at: ActiveValue::Set(account.updated_at),
        }
    }
}

impl TryFrom<Model> for Account {
    type Error = EngineError;

    fn try_from(model: Model) -> Result<Self, Self::Error> {
        Ok(Self {
            id: model.id,
            kind: AccountKind::try_from(model.kind.as_str())?,
            owner_ref: model.owner_ref,
            balance_cents: model.balance_cents,
            created_at: model.created_at,
            updated_at: model.updated_at,
        })
    }
}
