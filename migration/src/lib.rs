pub use sea_orm_migration::prelude::*;

mod m20250301_000001_create_groups_table;
mod m20250301_000002_create_api_keys_table;
mod m20250301_000003_create_policies_table;
mod m20250301_000004_create_group_policies_table;
mod m20250301_000005_create_system_settings_table;
mod m20250301_000006_create_request_logs_table;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20250301_000001_create_groups_table::Migration),
            Box::new(m20250301_000002_create_api_keys_table::Migration),
            Box::new(m20250301_000003_create_policies_table::Migration),
            Box::new(m20250301_000004_create_group_policies_table::Migration),
            Box::new(m20250301_000005_create_system_settings_table::Migration),
            Box::new(m20250301_000006_create_request_logs_table::Migration),
        ]
    }
}
