use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Groups::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Groups::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(Groups::Name)
                            .string_len(255)
                            .not_null()
                            .unique_key(),
                    )
                    .col(
                        ColumnDef::new(Groups::DisplayName)
                            .string_len(255)
                            .not_null()
                            .default(""),
                    )
                    .col(
                        ColumnDef::new(Groups::ProxyKeys)
                            .text()
                            .not_null()
                            .default(""),
                    )
                    .col(ColumnDef::new(Groups::Upstreams).json().not_null())
                    .col(
                        ColumnDef::new(Groups::ValidationEndpoint)
                            .string_len(255)
                            .not_null()
                            .default(""),
                    )
                    .col(
                        ColumnDef::new(Groups::ChannelType)
                            .string_len(50)
                            .not_null()
                            .default("openai"),
                    )
                    .col(
                        ColumnDef::new(Groups::TestModel)
                            .string_len(255)
                            .not_null()
                            .default(""),
                    )
                    .col(ColumnDef::new(Groups::ParamOverrides).json().not_null())
                    .col(ColumnDef::new(Groups::HeaderRules).json().not_null())
                    .col(ColumnDef::new(Groups::Config).json().not_null())
                    .col(
                        ColumnDef::new(Groups::Sort)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(Groups::LastValidatedAt).date_time())
                    .col(
                        ColumnDef::new(Groups::CreatedAt)
                            .date_time()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Groups::UpdatedAt)
                            .date_time()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Groups::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
pub enum Groups {
    Table,
    Id,
    Name,
    DisplayName,
    ProxyKeys,
    Upstreams,
    ValidationEndpoint,
    ChannelType,
    TestModel,
    ParamOverrides,
    HeaderRules,
    Config,
    Sort,
    LastValidatedAt,
    CreatedAt,
    UpdatedAt,
}
