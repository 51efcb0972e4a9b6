use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Bots::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Bots::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(Bots::TenantId).uuid().not_null())
                    .col(ColumnDef::new(Bots::Hostname).string().not_null())
                    .col(ColumnDef::new(Bots::ContainerRef).string().null())
                    .col(
                        ColumnDef::new(Bots::Status)
                            .string()
                            .not_null()
                            .default("draft"),
                    )
                    .col(
                        ColumnDef::new(Bots::HealthStatus)
                            .string()
                            .not_null()
                            .default("healthy"),
                    )
                    .col(
                        ColumnDef::new(Bots::LastHealthCheckAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(ColumnDef::new(Bots::GatewayPort).integer().null())
                    .col(ColumnDef::new(Bots::Image).string().null())
                    .col(
                        ColumnDef::new(Bots::DeletedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Bots::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Bots::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .index(
                        Index::create()
                            .name("idx_bots_tenant_hostname_unique")
                            .table(Bots::Table)
                            .col(Bots::TenantId)
                            .col(Bots::Hostname)
                            .unique(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_bots_container_ref")
                    .table(Bots::Table)
                    .col(Bots::ContainerRef)
                    .if_not_exists()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_bots_status")
                    .table(Bots::Table)
                    .col(Bots::Status)
                    .if_not_exists()
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Bots::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Bots {
    Table,
    Id,
    TenantId,
    Hostname,
    ContainerRef,
    Status,
    HealthStatus,
    LastHealthCheckAt,
    GatewayPort,
    Image,
    DeletedAt,
    CreatedAt,
    UpdatedAt,
}
