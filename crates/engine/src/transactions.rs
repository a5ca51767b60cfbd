//! Transaction primitives.
//!
//! A `Transaction` is an immutable ledger row. Its amount is always
//! positive: the kind decides which side is debited and which is credited.

use chrono::{DateTime, Utc};
use sea_orm::{ActiveValue, entity::prelude::*};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::{AccountKind, EngineError, ResultEngine, util::parse_uuid};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    DriverEarn,
    DriverRedeem,
    MerchantTopup,
    AdminGrant,
    MerchantEarn,
    CampaignGrant,
    CampaignClawback,
}

/// Account kinds a transaction kind debits and credits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Sides {
    pub debit: Option<AccountKind>,
    pub credit: Option<AccountKind>,
}

impl TransactionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DriverEarn => "driver_earn",
            Self::DriverRedeem => "driver_redeem",
            Self::MerchantTopup => "merchant_topup",
            Self::AdminGrant => "admin_grant",
            Self::MerchantEarn => "merchant_earn",
            Self::CampaignGrant => "campaign_grant",
            Self::CampaignClawback => "campaign_clawback",
        }
    }

    pub fn sides(self) -> Sides {
        match self {
            Self::DriverEarn | Self::AdminGrant | Self::CampaignGrant => Sides {
                debit: None,
                credit: Some(AccountKind::Driver),
            },
            Self::MerchantTopup | Self::MerchantEarn => Sides {
                debit: None,
                credit: Some(AccountKind::Merchant),
            },
            Self::DriverRedeem => Sides {
                debit: Some(AccountKind::Driver),
                credit: Some(AccountKind::Merchant),
            },
            Self::CampaignClawback => Sides {
                debit: Some(AccountKind::Driver),
                credit: None,
            },
        }
    }
}

impl TryFrom<&str> for TransactionKind {
    type Error = EngineError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "driver_earn" => Ok(Self::DriverEarn),
            "driver_redeem" => Ok(Self::DriverRedeem),
            "merchant_topup" => Ok(Self::MerchantTopup),
            "admin_grant" => Ok(Self::AdminGrant),
            "merchant_earn" => Ok(Self::MerchantEarn),
            "campaign_grant" => Ok(Self::CampaignGrant),
            "campaign_clawback" => Ok(Self::CampaignClawback),
            other => Err(EngineError::Corrupted(format!(
                "invalid transaction kind: {other}"
            ))),
        }
    }
}

/// Deterministic payload fingerprint.
///
/// Hashes the ordered tuple `(source, destination, amount, kind,
/// correlation_id)`. Every field is written with a presence tag and a length
/// prefix, so `(Some("ab"), None)` and `(None, Some("ab"))` never collide.
pub fn fingerprint(
    source: Option<&str>,
    destination: Option<&str>,
    amount_cents: i64,
    kind: TransactionKind,
    correlation_id: Option<&str>,
) -> String {
    fn field(hasher: &mut Sha256, value: Option<&[u8]>) {
        match value {
            Some(bytes) => {
                hasher.update([1u8]);
                hasher.update((bytes.len() as u64).to_be_bytes());
                hasher.update(bytes);
            }
            None => hasher.update([0u8]),
        }
    }

    let mut hasher = Sha256::new();
    field(&mut hasher, source.map(str::as_bytes));
    field(&mut hasher, destination.map(str::as_bytes));
    field(&mut hasher, Some(&amount_cents.to_be_bytes()));
    field(&mut hasher, Some(kind.as_str().as_bytes()));
    field(&mut hasher, correlation_id.map(str::as_bytes));
    hex::encode(hasher.finalize())
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub kind: TransactionKind,
    pub amount_cents: i64,
    /// Debited account id, if the kind debits.
    pub source: Option<String>,
    /// Credited account id, if the kind credits.
    pub destination: Option<String>,
    pub idempotency_key: Option<String>,
    pub payload_fingerprint: String,
    pub correlation_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub metadata: Option<serde_json::Value>,
}

impl Transaction {
    /// Signed effect of this transaction on `account_id`.
    pub fn delta_for(&self, account_id: &str) -> i64 {
        let mut delta = 0;
        if self.destination.as_deref() == Some(account_id) {
            delta += self.amount_cents;
        }
        if self.source.as_deref() == Some(account_id) {
            delta -= self.amount_cents;
        }
        delta
    }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "transactions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub kind: String,
    pub amount_cents: i64,
    pub src_account: Option<String>,
    pub dst_account: Option<String>,
    pub idempotency_key: Option<String>,
    pub payload_fingerprint: String,
    pub correlation_id: Option<String>,
    pub created_at: DateTimeUtc,
    pub metadata: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl TryFrom<&Transaction> for ActiveModel {
    type Error = EngineError;

    fn try_from(tx: &Transaction) -> Result<Self, Self::Error> {
        let metadata = tx
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|err| EngineError::InvalidAmount(format!("invalid metadata: {err}")))?;
        Ok(Self {
            id: ActiveValue::Set(tx.id.to_string()),
            kind: ActiveValue::Set(tx.kind.as_str().to_string()),
            amount_cents: ActiveValue::Set(tx.amount_cents),
            src_account: ActiveValue::Set(tx.source.clone()),
            dst_account: ActiveValue::Set(tx.destination.clone()),
            idempotency_key: ActiveValue::Set(tx.idempotency_key.clone()),
            payload_fingerprint: ActiveValue::Set(tx.payload_fingerprint.clone()),
            correlation_id: ActiveValue::Set(tx.correlation_id.clone()),
            created_at: ActiveValue::Set(tx.created_at),
            metadata: ActiveValue::Set(metadata),
        })
    }
}

impl TryFrom<Model> for Transaction {
    type Error = EngineError;

    fn try_from(model: Model) -> ResultEngine<Self> {
        let metadata = model
            .metadata
            .as_deref()
            .map(serde_json::from_str::<serde_json::Value>)
            .transpose()
            .map_err(|err| EngineError::Corrupted(format!("invalid transaction metadata: {err}")))?;
        Ok(Self {
            id: parse_uuid(&model.id, "transaction")?,
            kind: TransactionKind::try_from(model.kind.as_str())?,
            amount_cents: model.amount_cents,
            source: model.src_account,
            destination: model.dst_account,
            idempotency_key: model.idempotency_key,
            payload_fingerprint: model.payload_fingerprint,
            correlation_id: model.correlation_id,
            created_at: model.created_at,
            metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_deterministic() {
        let a = fingerprint(
            Some("driver:alice"),
            Some("merchant:cafe"),
            500,
            TransactionKind::DriverRedeem,
            Some("order-1"),
        );
        let b = fingerprint(
            Some("driver:alice"),
            Some("merchant:cafe"),
            500,
            TransactionKind::DriverRedeem,
            Some("order-1"),
        );
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn fingerprint_changes_with_each_field() {
        let base = fingerprint(
            None,
            Some("driver:alice"),
            500,
            TransactionKind::DriverEarn,
            None,
        );
        let variants = [
            fingerprint(None, Some("driver:bob"), 500, TransactionKind::DriverEarn, None),
            fingerprint(None, Some("driver:alice"), 501, TransactionKind::DriverEarn, None),
            fingerprint(None, Some("driver:alice"), 500, TransactionKind::AdminGrant, None),
            fingerprint(
                None,
                Some("driver:alice"),
                500,
                TransactionKind::DriverEarn,
                Some("c"),
            ),
            fingerprint(Some("driver:alice"), None, 500, TransactionKind::DriverEarn, None),
        ];
        for variant in variants {
            assert_ne!(base, variant);
        }
    }

    #[test]
    fn delta_for_follows_sides() {
        let tx = Transaction {
            id: Uuid::new_v4(),
            kind: TransactionKind::DriverRedeem,
            amount_cents: 300,
            source: Some("driver:alice".to_string()),
            destination: Some("merchant:cafe".to_string()),
            idempotency_key: None,
            payload_fingerprint: String::new(),
            correlation_id: None,
            created_at: Utc::now(),
            metadata: None,
        };
        assert_eq!(tx.delta_for("driver:alice"), -300);
        assert_eq!(tx.delta_for("merchant:cafe"), 300);
        assert_eq!(tx.delta_for("driver:bob"), 0);
    }
}
