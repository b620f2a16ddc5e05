//! Durable cache of generated scene images, keyed by scene number
use std::collections::BTreeMap;

use chrono::Utc;
use sea_orm::{ActiveValue::Set, QueryOrder, entity::prelude::*, sea_query::OnConflict};
use tracing::warn;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "scene_images")]
/// Last known image for a scene
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    /// scene number
    pub scene_number: i64,
    /// prompt the scene had when it was queued, used to tell scripts apart
    pub source_prompt: String,
    /// generated image location
    pub image_url: String,
    /// prompt that produced the image
    pub prompt: String,
    /// when the row was last written
    pub updated_at: DateTime,
}

/// no relations
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

/// What the cache remembers about a scene
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CachedImage {
    /// prompt the scene was queued with
    pub source_prompt: String,
    /// generated image location
    pub image_url: String,
    /// prompt that produced it, which differs from `source_prompt` after a rewrite
    pub prompt: String,
}

/// Writes the image for a scene; a second write for the same scene replaces the first.
pub async fn store(
    db: &DatabaseConnection,
    scene_number: u32,
    image: &CachedImage,
) -> Result<(), DbErr> {
    let active = ActiveModel {
        scene_number: Set(i64::from(scene_number)),
        source_prompt: Set(image.source_prompt.clone()),
        image_url: Set(image.image_url.clone()),
        prompt: Set(image.prompt.clone()),
        updated_at: Set(Utc::now().naive_utc()),
    };
    Entity::insert(active)
        .on_conflict(
            OnConflict::column(Column::SceneNumber)
                .update_columns([
                    Column::SourcePrompt,
                    Column::ImageUrl,
                    Column::Prompt,
                    Column::UpdatedAt,
                ])
                .to_owned(),
        )
        .exec_without_returning(db)
        .await?;
    Ok(())
}

/// Every cached image, by scene number.
pub async fn load_all(db: &DatabaseConnection) -> Result<BTreeMap<u32, CachedImage>, DbErr> {
    let rows = Entity::find()
        .order_by_asc(Column::SceneNumber)
        .all(db)
        .await?;
    let mut cached = BTreeMap::new();
    for row in rows {
        let Ok(scene_number) = u32::try_from(row.scene_number) else {
            warn!("Ignoring cached image with invalid scene number {}", row.scene_number);
            continue;
        };
        cached.insert(
            scene_number,
            CachedImage {
                source_prompt: row.source_prompt,
                image_url: row.image_url,
                prompt: row.prompt,
            },
        );
    }
    Ok(cached)
}

/// Removes every cached image, returning how many there were.
pub async fn clear(db: &DatabaseConnection) -> Result<u64, DbErr> {
    Ok(Entity::delete_many().exec(db).await?.rows_affected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm::PaginatorTrait;
    use sea_orm_migration::MigratorTrait;

    fn image(source: &str, url: &str, prompt: &str) -> CachedImage {
        CachedImage {
            source_prompt: source.to_string(),
            image_url: url.to_string(),
            prompt: prompt.to_string(),
        }
    }

    async fn setup_db() -> DatabaseConnection {
        let db = crate::db::connect_test_db()
            .await
            .expect("connect test db");
        crate::db::migrations::Migrator::up(&db, None)
            .await
            .expect("run migrations");
        db
    }

    #[tokio::test]
    async fn last_write_wins() {
        let db = setup_db().await;
        store(&db, 3, &image("scene 3", "https://img/3a.png", "first"))
            .await
            .expect("store");
        store(&db, 3, &image("scene 3", "https://img/3b.png", "second"))
            .await
            .expect("store again");
        store(&db, 1, &image("scene 1", "https://img/1.png", "one"))
            .await
            .expect("store other");

        let cached = load_all(&db).await.expect("load");
        assert_eq!(cached.len(), 2);
        assert_eq!(
            cached.get(&3),
            Some(&image("scene 3", "https://img/3b.png", "second"))
        );
        assert_eq!(Entity::find().count(&db).await.expect("count"), 2);
    }

    #[tokio::test]
    async fn clear_empties_the_cache() {
        let db = setup_db().await;
        store(&db, 1, &image("scene 1", "https://img/1.png", "one"))
            .await
            .expect("store");
        store(&db, 2, &image("scene 2", "https://img/2.png", "two"))
            .await
            .expect("store");

        assert_eq!(clear(&db).await.expect("clear"), 2);
        assert!(load_all(&db).await.expect("load").is_empty());
    }
}
