//! Empty the durable scene image cache so the next run regenerates everything.

use anyhow::Result;
use clap::Parser;
use scenegen::constants::DEFAULT_DATABASE_PATH;
use scenegen::db::entities::scene_images;
use sea_orm_migration::MigratorTrait;

#[derive(Parser, Debug)]
#[command(name = "clear_scene_cache")]
struct Args {
    /// Path to the image cache database
    #[arg(long, default_value = DEFAULT_DATABASE_PATH, env = "SCENEGEN_DATABASE_PATH")]
    database_path: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let db = scenegen::db::connect_db(&args.database_path).await?;
    scenegen::db::migrations::Migrator::up(&db, None).await?;
    let removed = scene_images::clear(&db).await?;

    println!("Removed {removed} cached images from {}.", args.database_path);
    Ok(())
}
