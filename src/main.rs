use std::sync::Arc;

use anyhow::{Context, anyhow};
use clap::Parser;
use scenegen::client::{HttpEndpoint, HttpImageClient, HttpRewriteClient};
use scenegen::config::{load_error_vocabulary, setup_logging};
use scenegen::pipeline::{GenerationPipeline, RunOutcome};
use scenegen::rewriter::PromptRewriter;
use scenegen::scene::{load_characters, load_scenes};
use sea_orm_migration::MigratorTrait;
use tracing::{info, warn};

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = scenegen::cli::CliOptions::parse();

    setup_logging(cli.debug).context("Failed to set up logging")?;

    let scenes = load_scenes(&cli.scenes)
        .with_context(|| format!("Failed to read scenes from {}", cli.scenes.display()))?;
    let characters = match &cli.characters {
        Some(path) => load_characters(path)
            .with_context(|| format!("Failed to read characters from {}", path.display()))?,
        None => Vec::new(),
    };
    let vocabulary = load_error_vocabulary(cli.error_vocabulary.as_deref())
        .context("Failed to load error vocabulary")?;

    let timeout = cli.request_timeout();
    let images = HttpImageClient::new(HttpEndpoint::new(
        &cli.image_endpoint,
        cli.api_key.clone(),
        timeout,
    )?);
    let rewrites = HttpRewriteClient::new(HttpEndpoint::new(
        &cli.rewrite_endpoint,
        cli.api_key.clone(),
        timeout,
    )?);

    let mut pipeline = GenerationPipeline::new(
        Arc::new(images),
        PromptRewriter::new(Arc::new(rewrites), cli.output_directive.clone()),
        vocabulary,
        cli.pipeline_settings(),
    );
    if !cli.no_cache {
        let db = scenegen::db::connect_db(&cli.database_path)
            .await
            .context("Database connection error")?;
        scenegen::db::migrations::Migrator::up(&db, None)
            .await
            .context("Database migration error")?;
        pipeline = pipeline.with_cache(db);
    }
    let pipeline = Arc::new(pipeline);

    let canceller = pipeline.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing in-flight requests before stopping");
            canceller.cancel();
        }
    });

    let mut progress = pipeline.subscribe();
    tokio::spawn(async move {
        let mut last_done = 0;
        let mut last_rewrite = None;
        while progress.changed().await.is_ok() {
            let state = progress.borrow_and_update().clone();
            let done = state.completed_images + state.failed_images;
            if state.is_generating && done != last_done {
                last_done = done;
                info!(
                    "Progress: {}/{} ({} failed)",
                    done, state.total_images, state.failed_images
                );
            }
            let rewrite = state
                .rewrite
                .scene_number
                .filter(|_| state.rewrite.is_rewriting)
                .map(|scene| (scene, state.rewrite.attempt));
            if rewrite != last_rewrite
                && let Some((scene, attempt)) = rewrite
            {
                info!("Rewriting blocked prompt for scene {scene} (attempt {attempt})");
            }
            last_rewrite = rewrite;
        }
    });

    info!(
        "Starting generation of {} scenes with {} workers",
        scenes.len(),
        pipeline.concurrency()
    );
    let report = pipeline.run(scenes, &characters).await?;

    let output = serde_json::to_vec_pretty(&report.scenes)?;
    std::fs::write(&cli.output, output)
        .with_context(|| format!("Failed to write {}", cli.output.display()))?;
    info!("Wrote {}", cli.output.display());

    let summary = report.outcome.summary(&report.stats);
    match report.outcome {
        RunOutcome::AuthenticationFailed { .. } => Err(anyhow!(summary)),
        _ => {
            println!("{summary}");
            Ok(())
        }
    }
}
