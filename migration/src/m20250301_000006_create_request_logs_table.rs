use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(RequestLogs::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(RequestLogs::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(RequestLogs::Timestamp).date_time().not_null())
                    .col(ColumnDef::new(RequestLogs::GroupId).integer().not_null())
                    .col(
                        ColumnDef::new(RequestLogs::KeyHash)
                            .string_len(128)
                            .not_null()
                            .default(""),
                    )
                    .col(
                        ColumnDef::new(RequestLogs::Model)
                            .string_len(255)
                            .not_null()
                            .default(""),
                    )
                    .col(ColumnDef::new(RequestLogs::IsSuccess).boolean().not_null())
                    .col(ColumnDef::new(RequestLogs::StatusCode).integer().not_null())
                    .col(
                        ColumnDef::new(RequestLogs::RequestPath)
                            .string_len(1024)
                            .not_null()
                            .default(""),
                    )
                    .col(
                        ColumnDef::new(RequestLogs::DurationMs)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(RequestLogs::ErrorMessage)
                            .text()
                            .not_null()
                            .default(""),
                    )
                    .col(
                        ColumnDef::new(RequestLogs::RequestType)
                            .string_len(20)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(RequestLogs::CreatedAt)
                            .date_time()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_request_logs_group_id_timestamp")
                    .table(RequestLogs::Table)
                    .col(RequestLogs::GroupId)
                    .col(RequestLogs::Timestamp)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(RequestLogs::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
pub enum RequestLogs {
    Table,
    Id,
    Timestamp,
    GroupId,
    KeyHash,
    Model,
    IsSuccess,
    StatusCode,
    RequestPath,
    DurationMs,
    ErrorMessage,
    RequestType,
    CreatedAt,
}
