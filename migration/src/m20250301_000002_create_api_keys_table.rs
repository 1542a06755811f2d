use sea_orm_migration::prelude::*;

use super::m20250301_000001_create_groups_table::Groups;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(ApiKeys::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ApiKeys::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(ApiKeys::GroupId).integer().not_null())
                    .col(ColumnDef::new(ApiKeys::KeyValue).text().not_null())
                    .col(ColumnDef::new(ApiKeys::KeyHash).string_len(128).not_null())
                    .col(
                        ColumnDef::new(ApiKeys::Status)
                            .string_len(20)
                            .not_null()
                            .default("pending"),
                    )
                    .col(
                        ColumnDef::new(ApiKeys::RequestCount)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(ApiKeys::FailureCount)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(ApiKeys::ConsecutiveFailures)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(ApiKeys::BackoffLevel)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(ApiKeys::LastUsedAt).date_time())
                    .col(ColumnDef::new(ApiKeys::LastFailureAt).date_time())
                    .col(ColumnDef::new(ApiKeys::LastSuccessAt).date_time())
                    .col(ColumnDef::new(ApiKeys::LastValidatedAt).date_time())
                    .col(ColumnDef::new(ApiKeys::DisabledUntil).date_time())
                    .col(
                        ColumnDef::new(ApiKeys::LastErrorMessage)
                            .text()
                            .not_null()
                            .default(""),
                    )
                    .col(
                        ColumnDef::new(ApiKeys::CreatedAt)
                            .date_time()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(ApiKeys::UpdatedAt)
                            .date_time()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_api_keys_group_id")
                            .from(ApiKeys::Table, ApiKeys::GroupId)
                            .to(Groups::Table, Groups::Id)
                            .on_update(ForeignKeyAction::Cascade)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // 同一凭证在一个分组内只允许注册一次
        manager
            .create_index(
                Index::create()
                    .name("idx_api_keys_group_id_key_hash")
                    .table(ApiKeys::Table)
                    .col(ApiKeys::GroupId)
                    .col(ApiKeys::KeyHash)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_api_keys_group_id_status")
                    .table(ApiKeys::Table)
                    .col(ApiKeys::GroupId)
                    .col(ApiKeys::Status)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(ApiKeys::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
pub enum ApiKeys {
    Table,
    Id,
    GroupId,
    KeyValue,
    KeyHash,
    Status,
    RequestCount,
    FailureCount,
    ConsecutiveFailures,
    BackoffLevel,
    LastUsedAt,
    LastFailureAt,
    LastSuccessAt,
    LastValidatedAt,
    DisabledUntil,
    LastErrorMessage,
    CreatedAt,
    UpdatedAt,
}
