use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(SceneImages::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(SceneImages::SceneNumber)
                            .big_integer()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(SceneImages::SourcePrompt).text().not_null())
                    .col(ColumnDef::new(SceneImages::ImageUrl).string().not_null())
                    .col(ColumnDef::new(SceneImages::Prompt).text().not_null())
                    .col(
                        ColumnDef::new(SceneImages::UpdatedAt)
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
            .drop_table(Table::drop().table(SceneImages::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum SceneImages {
    Table,
    SceneNumber,
    SourcePrompt,
    ImageUrl,
    Prompt,
    UpdatedAt,
}
