use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // Enable foreign keys for SQLite
        if manager.get_database_backend() == sea_orm::DatabaseBackend::Sqlite {
            manager
                .get_connection()
                .execute_unprepared("PRAGMA foreign_keys = ON")
                .await?;
        }

        // Create devices table
        manager
            .create_table(
                Table::create()
                    .table(Devices::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Devices::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(Devices::Key)
                            .string()
                            .not_null()
                            .unique_key(),
                    )
                    .col(string_null(Devices::Name))
                    .col(string(Devices::RotationState))
                    .col(string(Devices::Secret))
                    .col(string_null(Devices::CachedSecret))
                    .col(big_integer(Devices::SecretCreatedAt))
                    .col(big_integer_null(Devices::LastRotationAttemptAt))
                    .col(big_integer_null(Devices::LastRotationCompletedAt))
                    .col(big_integer(Devices::CreatedAt))
                    .to_owned(),
            )
            .await?;

        // Create index on devices.rotation_state (eligibility scans)
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_devices_rotation_state")
                    .table(Devices::Table)
                    .col(Devices::RotationState)
                    .to_owned(),
            )
            .await?;

        // Create index on devices.secret_created_at (oldest-secret-first ordering)
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_devices_secret_created")
                    .table(Devices::Table)
                    .col(Devices::SecretCreatedAt)
                    .to_owned(),
            )
            .await?;

        // Create fleet_schedule table (single row shared by all workers)
        manager
            .create_table(
                Table::create()
                    .table(FleetSchedule::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(FleetSchedule::Id)
                            .integer()
                            .not_null()
                            .primary_key(),
                    )
                    .col(big_integer(FleetSchedule::LastTriggeredAt))
                    .to_owned(),
            )
            .await?;

        // Create job_executions table with backend-specific ID type
        let id_col = match manager.get_database_backend() {
            sea_orm::DatabaseBackend::Postgres => ColumnDef::new(JobExecutions::Id)
                .big_integer()
                .not_null()
                .auto_increment()
                .primary_key()
                .to_owned(),
            _ => ColumnDef::new(JobExecutions::Id)
                .integer()
                .not_null()
                .auto_increment()
                .primary_key()
                .to_owned(),
        };

        manager
            .create_table(
                Table::create()
                    .table(JobExecutions::Table)
                    .if_not_exists()
                    .col(id_col)
                    .col(string(JobExecutions::JobName))
                    .col(big_integer(JobExecutions::StartedAt))
                    .col(big_integer_null(JobExecutions::CompletedAt))
                    .col(big_integer_null(JobExecutions::Success))
                    .col(string_null(JobExecutions::ErrorMessage))
                    .col(big_integer_null(JobExecutions::RecordsProcessed))
                    .to_owned(),
            )
            .await?;

        // Create index on job_executions.started_at
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_job_executions_started")
                    .table(JobExecutions::Table)
                    .col(JobExecutions::StartedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(JobExecutions::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(FleetSchedule::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Devices::Table).to_owned())
            .await?;
        Ok(())
    }
}

#[derive(DeriveIden)]
enum Devices {
    Table,
    Id,
    Key,
    Name,
    RotationState,
    Secret,
    CachedSecret,
    SecretCreatedAt,
    LastRotationAttemptAt,
    LastRotationCompletedAt,
    CreatedAt,
}

#[derive(DeriveIden)]
enum FleetSchedule {
    Table,
    Id,
    LastTriggeredAt,
}

#[derive(DeriveIden)]
enum JobExecutions {
    Table,
    Id,
    JobName,
    StartedAt,
    CompletedAt,
    Success,
    ErrorMessage,
    RecordsProcessed,
}
