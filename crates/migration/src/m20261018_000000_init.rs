//! Initial schema migration.
//!
//! - `accounts`: driver wallets and merchant balances
//! - `transactions`: the append-only ledger
//! - `campaigns`: budgeted incentive programs
//! - `session_events`: observed charging sessions
//! - `incentive_grants`: one campaign rewarding one session

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

// ─────────────────────────────────────────────────────────────────────────────
// Table identifiers
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Iden)]
enum Accounts {
    Table,
    Id,
    Kind,
    OwnerRef,
    BalanceCents,
    CreatedAt,
    UpdatedAt,
}

#[derive(Iden)]
enum Transactions {
    Table,
    Id,
    Kind,
    AmountCents,
    SrcAccount,
    DstAccount,
    IdempotencyKey,
    PayloadFingerprint,
    CorrelationId,
    CreatedAt,
    Metadata,
}

#[derive(Iden)]
enum Campaigns {
    Table,
    Id,
    Name,
    Description,
    SponsorName,
    SponsorRef,
    BudgetCents,
    SpentCents,
    CostPerSessionCents,
    MaxSessions,
    SessionsGranted,
    Priority,
    Status,
    StartDate,
    EndDate,
    Timezone,
    Rules,
    DailyCap,
    LifetimeCap,
    PerChargerCap,
    PauseReason,
    CreatedAt,
    UpdatedAt,
}

#[derive(Iden)]
enum SessionEvents {
    Table,
    Id,
    DriverId,
    VehicleRef,
    ChargerId,
    ChargerNetwork,
    Zone,
    ConnectorType,
    PowerKw,
    SessionStart,
    SessionEnd,
    DurationMinutes,
    KwhDelivered,
    VerificationSource,
    VerificationMethod,
    Verified,
    SourceSessionId,
    QualityScore,
    EndedReason,
    StartLat,
    StartLng,
    BatteryStartPct,
    BatteryEndPct,
    LocationTrail,
    LastUpdateAt,
    CreatedAt,
}

#[derive(Iden)]
enum IncentiveGrants {
    Table,
    Id,
    SessionEventId,
    CampaignId,
    DriverId,
    ChargerId,
    SessionEndedAt,
    AmountCents,
    Status,
    IdempotencyKey,
    TransactionId,
    ClawbackTransactionId,
    ClawbackReason,
    ClawedBackAt,
    CreatedAt,
}

// ─────────────────────────────────────────────────────────────────────────────
// Migration implementation
// ─────────────────────────────────────────────────────────────────────────────

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // ───────────────────────────────────────────────────────────────────
        // 1. Accounts
        // ───────────────────────────────────────────────────────────────────
        manager
            .create_table(
                Table::create()
                    .table(Accounts::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Accounts::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Accounts::Kind).string().not_null())
                    .col(ColumnDef::new(Accounts::OwnerRef).string().not_null())
                    .col(
                        ColumnDef::new(Accounts::BalanceCents)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(Accounts::CreatedAt).timestamp().not_null())
                    .col(ColumnDef::new(Accounts::UpdatedAt).timestamp().not_null())
                    .to_owned(),
            )
            .await?;

        // ───────────────────────────────────────────────────────────────────
        // 2. Transactions
        // ───────────────────────────────────────────────────────────────────
        manager
            .create_table(
                Table::create()
                    .table(Transactions::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Transactions::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Transactions::Kind).string().not_null())
                    .col(
                        ColumnDef::new(Transactions::AmountCents)
                            .big_integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(Transactions::SrcAccount).string())
                    .col(ColumnDef::new(Transactions::DstAccount).string())
                    .col(ColumnDef::new(Transactions::IdempotencyKey).string())
                    .col(
                        ColumnDef::new(Transactions::PayloadFingerprint)
                            .string()
                            .not_null(),
                    )
                    .col(ColumnDef::new(Transactions::CorrelationId).string())
                    .col(
                        ColumnDef::new(Transactions::CreatedAt)
                            .timestamp()
                            .not_null(),
                    )
                    .col(ColumnDef::new(Transactions::Metadata).text())
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk-transactions-src_account")
                            .from(Transactions::Table, Transactions::SrcAccount)
                            .to(Accounts::Table, Accounts::Id),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk-transactions-dst_account")
                            .from(Transactions::Table, Transactions::DstAccount)
                            .to(Accounts::Table, Accounts::Id),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-transactions-kind-idempotency_key")
                    .table(Transactions::Table)
                    .col(Transactions::Kind)
                    .col(Transactions::IdempotencyKey)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-transactions-src_account")
                    .table(Transactions::Table)
                    .col(Transactions::SrcAccount)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-transactions-dst_account")
                    .table(Transactions::Table)
                    .col(Transactions::DstAccount)
                    .to_owned(),
            )
            .await?;

        // ───────────────────────────────────────────────────────────────────
        // 3. Campaigns
        // ───────────────────────────────────────────────────────────────────
        manager
            .create_table(
                Table::create()
                    .table(Campaigns::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Campaigns::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Campaigns::Name).string().not_null())
                    .col(ColumnDef::new(Campaigns::Description).text())
                    .col(ColumnDef::new(Campaigns::SponsorName).string().not_null())
                    .col(ColumnDef::new(Campaigns::SponsorRef).string())
                    .col(
                        ColumnDef::new(Campaigns::BudgetCents)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Campaigns::SpentCents)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Campaigns::CostPerSessionCents)
                            .big_integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(Campaigns::MaxSessions).big_integer())
                    .col(
                        ColumnDef::new(Campaigns::SessionsGranted)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(Campaigns::Priority).integer().not_null())
                    .col(ColumnDef::new(Campaigns::Status).string().not_null())
                    .col(ColumnDef::new(Campaigns::StartDate).timestamp().not_null())
                    .col(ColumnDef::new(Campaigns::EndDate).timestamp())
                    .col(
                        ColumnDef::new(Campaigns::Timezone)
                            .string()
                            .not_null()
                            .default("UTC"),
                    )
                    .col(ColumnDef::new(Campaigns::Rules).text().not_null())
                    .col(ColumnDef::new(Campaigns::DailyCap).integer())
                    .col(ColumnDef::new(Campaigns::LifetimeCap).integer())
                    .col(ColumnDef::new(Campaigns::PerChargerCap).integer())
                    .col(ColumnDef::new(Campaigns::PauseReason).string())
                    .col(ColumnDef::new(Campaigns::CreatedAt).timestamp().not_null())
                    .col(ColumnDef::new(Campaigns::UpdatedAt).timestamp().not_null())
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-campaigns-status-priority")
                    .table(Campaigns::Table)
                    .col(Campaigns::Status)
                    .col(Campaigns::Priority)
                    .to_owned(),
            )
            .await?;

        // ───────────────────────────────────────────────────────────────────
        // 4. Session events
        // ───────────────────────────────────────────────────────────────────
        manager
            .create_table(
                Table::create()
                    .table(SessionEvents::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(SessionEvents::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(SessionEvents::DriverId).string().not_null())
                    .col(ColumnDef::new(SessionEvents::VehicleRef).string())
                    .col(ColumnDef::new(SessionEvents::ChargerId).string())
                    .col(ColumnDef::new(SessionEvents::ChargerNetwork).string())
                    .col(ColumnDef::new(SessionEvents::Zone).string())
                    .col(ColumnDef::new(SessionEvents::ConnectorType).string())
                    .col(ColumnDef::new(SessionEvents::PowerKw).double())
                    .col(
                        ColumnDef::new(SessionEvents::SessionStart)
                            .timestamp()
                            .not_null(),
                    )
                    .col(ColumnDef::new(SessionEvents::SessionEnd).timestamp())
                    .col(ColumnDef::new(SessionEvents::DurationMinutes).big_integer())
                    .col(
                        ColumnDef::new(SessionEvents::KwhDelivered)
                            .double()
                            .not_null()
                            .default(0.0),
                    )
                    .col(
                        ColumnDef::new(SessionEvents::VerificationSource)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(SessionEvents::VerificationMethod)
                            .string()
                            .not_null(),
                    )
                    .col(ColumnDef::new(SessionEvents::Verified).boolean().not_null())
                    .col(ColumnDef::new(SessionEvents::SourceSessionId).string())
                    .col(ColumnDef::new(SessionEvents::QualityScore).integer())
                    .col(ColumnDef::new(SessionEvents::EndedReason).string())
                    .col(ColumnDef::new(SessionEvents::StartLat).double())
                    .col(ColumnDef::new(SessionEvents::StartLng).double())
                    .col(ColumnDef::new(SessionEvents::BatteryStartPct).double())
                    .col(ColumnDef::new(SessionEvents::BatteryEndPct).double())
                    .col(
                        ColumnDef::new(SessionEvents::LocationTrail)
                            .text()
                            .not_null()
                            .default("[]"),
                    )
                    .col(
                        ColumnDef::new(SessionEvents::LastUpdateAt)
                            .timestamp()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(SessionEvents::CreatedAt)
                            .timestamp()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-session_events-source-source_session_id-unique")
                    .table(SessionEvents::Table)
                    .col(SessionEvents::VerificationSource)
                    .col(SessionEvents::SourceSessionId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-session_events-driver_id-session_start")
                    .table(SessionEvents::Table)
                    .col(SessionEvents::DriverId)
                    .col(SessionEvents::SessionStart)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-session_events-session_end-last_update_at")
                    .table(SessionEvents::Table)
                    .col(SessionEvents::SessionEnd)
                    .col(SessionEvents::LastUpdateAt)
                    .to_owned(),
            )
            .await?;

        // ───────────────────────────────────────────────────────────────────
        // 5. Incentive grants
        // ───────────────────────────────────────────────────────────────────
        manager
            .create_table(
                Table::create()
                    .table(IncentiveGrants::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(IncentiveGrants::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(IncentiveGrants::SessionEventId)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(IncentiveGrants::CampaignId)
                            .string()
                            .not_null(),
                    )
                    .col(ColumnDef::new(IncentiveGrants::DriverId).string().not_null())
                    .col(ColumnDef::new(IncentiveGrants::ChargerId).string())
                    .col(
                        ColumnDef::new(IncentiveGrants::SessionEndedAt)
                            .timestamp()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(IncentiveGrants::AmountCents)
                            .big_integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(IncentiveGrants::Status).string().not_null())
                    .col(
                        ColumnDef::new(IncentiveGrants::IdempotencyKey)
                            .string()
                            .not_null(),
                    )
                    .col(ColumnDef::new(IncentiveGrants::TransactionId).string())
                    .col(ColumnDef::new(IncentiveGrants::ClawbackTransactionId).string())
                    .col(ColumnDef::new(IncentiveGrants::ClawbackReason).string())
                    .col(ColumnDef::new(IncentiveGrants::ClawedBackAt).timestamp())
                    .col(
                        ColumnDef::new(IncentiveGrants::CreatedAt)
                            .timestamp()
                            .not_null(),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk-incentive_grants-session_event_id")
                            .from(IncentiveGrants::Table, IncentiveGrants::SessionEventId)
                            .to(SessionEvents::Table, SessionEvents::Id),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk-incentive_grants-campaign_id")
                            .from(IncentiveGrants::Table, IncentiveGrants::CampaignId)
                            .to(Campaigns::Table, Campaigns::Id),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-incentive_grants-session_event_id-unique")
                    .table(IncentiveGrants::Table)
                    .col(IncentiveGrants::SessionEventId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-incentive_grants-idempotency_key-unique")
                    .table(IncentiveGrants::Table)
                    .col(IncentiveGrants::IdempotencyKey)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-incentive_grants-campaign_id-driver_id")
                    .table(IncentiveGrants::Table)
                    .col(IncentiveGrants::CampaignId)
                    .col(IncentiveGrants::DriverId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(IncentiveGrants::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(SessionEvents::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Campaigns::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Transactions::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Accounts::Table).to_owned())
            .await?;
        Ok(())
    }
}
