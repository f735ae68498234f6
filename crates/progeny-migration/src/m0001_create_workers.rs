use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Workers::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Workers::Identifier)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Workers::SessionName).string().not_null())
                    .col(
                        ColumnDef::new(Workers::Port)
                            .integer()
                            .not_null()
                            .unique_key(),
                    )
                    .col(
                        ColumnDef::new(Workers::Pid)
                            .integer()
                            .not_null()
                            .unique_key(),
                    )
                    .col(
                        ColumnDef::new(Workers::ExpiryTimestamp)
                            .big_integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(Workers::CreatedAt).big_integer().not_null())
                    .to_owned(),
            )
            .await?;

        // Gateway lookups go by session name.
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_workers_session_name")
                    .table(Workers::Table)
                    .col(Workers::SessionName)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Workers::Table).if_exists().to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Workers {
    Table,
    Identifier,
    SessionName,
    Port,
    Pid,
    ExpiryTimestamp,
    CreatedAt,
}
