use sea_orm_migration::prelude::*;

use super::m20250301_000001_create_groups_table::Groups;
use super::m20250301_000003_create_policies_table::Policies;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(GroupPolicies::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(GroupPolicies::GroupId).integer().not_null())
                    .col(
                        ColumnDef::new(GroupPolicies::PolicyId)
                            .integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(GroupPolicies::Priority)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(GroupPolicies::IsActive)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(
                        ColumnDef::new(GroupPolicies::CreatedAt)
                            .date_time()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(GroupPolicies::UpdatedAt)
                            .date_time()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .primary_key(
                        Index::create()
                            .col(GroupPolicies::GroupId)
                            .col(GroupPolicies::PolicyId),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_group_policies_group_id")
                            .from(GroupPolicies::Table, GroupPolicies::GroupId)
                            .to(Groups::Table, Groups::Id)
                            .on_update(ForeignKeyAction::Cascade)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_group_policies_policy_id")
                            .from(GroupPolicies::Table, GroupPolicies::PolicyId)
                            .to(Policies::Table, Policies::Id)
                            .on_update(ForeignKeyAction::Cascade)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(GroupPolicies::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
pub enum GroupPolicies {
    Table,
    GroupId,
    PolicyId,
    Priority,
    IsActive,
    CreatedAt,
    UpdatedAt,
}
