//! Batch controller: queue, worker pool and run summary.
//!
//! A run hands scenes without an image to a fixed number of workers. Workers
//! take the next queue slot from a shared cursor, so a slot is only ever
//! processed once, and keep going until the queue is empty, the caller
//! cancels, or one of them hits an authentication failure.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use sea_orm::DatabaseConnection;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::classify::ErrorVocabulary;
use crate::client::ImageGenerator;
use crate::constants::{DEFAULT_ASPECT_RATIO, DEFAULT_REQUESTS_PER_COOKIE};
use crate::db::entities::scene_images;
use crate::error::ScenegenError;
use crate::generator::{ItemOutcome, RetryPolicy, SceneGenerator};
use crate::progress::{GenerationState, ProgressAggregator, RunStats};
use crate::rewriter::PromptRewriter;
use crate::scene::{CharacterDescriptor, Scene, seed_for};
use crate::signal::StopSignal;

/// Knobs for a pipeline.
#[derive(Clone, Debug, PartialEq)]
pub struct PipelineSettings {
    /// Upstream credentials available
    pub cookie_count: usize,
    /// Concurrent requests each credential tolerates
    pub requests_per_cookie: usize,
    /// Per-scene retry budget
    pub retry: RetryPolicy,
    /// Aspect ratio sent with every request
    pub aspect_ratio: String,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            cookie_count: 1,
            requests_per_cookie: DEFAULT_REQUESTS_PER_COOKIE,
            retry: RetryPolicy::default(),
            aspect_ratio: DEFAULT_ASPECT_RATIO.to_string(),
        }
    }
}

impl PipelineSettings {
    /// Number of workers: `max(1, cookies) × requests per cookie`.
    pub fn concurrency(&self) -> usize {
        self.cookie_count.max(1) * self.requests_per_cookie.max(1)
    }
}

/// How a run ended, from the user's point of view.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RunOutcome {
    /// Every queued scene got an image.
    Success,
    /// Some scenes gave up.
    PartialSuccess {
        /// Scenes that gave up
        failed: usize,
        /// At least one gave up because of rate limiting
        rate_limited: bool,
    },
    /// The caller stopped the run early.
    Cancelled {
        /// Scenes done before the stop
        completed: usize,
        /// Scenes that gave up before the stop
        failed: usize,
    },
    /// The upstream credential was rejected and the run aborted.
    AuthenticationFailed {
        /// Upstream message
        message: String,
    },
}

impl RunOutcome {
    /// One-line message for the user.
    pub fn summary(&self, stats: &RunStats) -> String {
        match self {
            Self::Success => format!(
                "All {} images generated in {:.0}s ({:.1} per minute)",
                stats.completed,
                stats.elapsed.as_secs_f64(),
                stats.items_per_minute
            ),
            Self::PartialSuccess {
                failed,
                rate_limited: true,
            } => format!(
                "{}/{} images generated; {failed} failed after hitting the rate limit. Wait a few minutes and retry scenes {:?}",
                stats.completed, stats.total, stats.failed_indexes
            ),
            Self::PartialSuccess {
                failed,
                rate_limited: false,
            } => format!(
                "{}/{} images generated; {failed} failed with errors. Check the prompts for scenes {:?} and retry",
                stats.completed, stats.total, stats.failed_indexes
            ),
            Self::Cancelled { completed, failed } => format!(
                "Cancelled: {completed} images generated and {failed} failed before stopping ({} queued)",
                stats.total
            ),
            Self::AuthenticationFailed { message } => format!(
                "Authentication failed ({message}). Refresh the upstream credentials and run again; {} images were generated before stopping",
                stats.completed
            ),
        }
    }
}

/// Result of [`GenerationPipeline::run`].
#[derive(Clone, Debug)]
pub struct RunReport {
    /// How it ended
    pub outcome: RunOutcome,
    /// Final counts and timings
    pub stats: RunStats,
    /// Every scene, with images filled in where generation succeeded
    pub scenes: Vec<Scene>,
}

/// Drives batch generation. Pass it to whatever needs to start, watch or cancel runs.
pub struct GenerationPipeline {
    generator: SceneGenerator,
    concurrency: usize,
    cache: Option<DatabaseConnection>,
    progress: Arc<ProgressAggregator>,
    signal: Mutex<StopSignal>,
    running: AtomicBool,
}

/// Held for the length of a run; releases the pipeline when dropped, even if
/// the run future is dropped part way through.
struct RunClaim<'a> {
    running: &'a AtomicBool,
}

impl<'a> RunClaim<'a> {
    fn acquire(running: &'a AtomicBool) -> Option<Self> {
        running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self { running })
    }
}

impl Drop for RunClaim<'_> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

struct RunQueue {
    scenes: Vec<Scene>,
    seeds: Vec<Option<i64>>,
    cursor: AtomicUsize,
}

impl RunQueue {
    /// Claims the next slot, or `None` once the queue is drained.
    fn claim(&self) -> Option<(&Scene, Option<i64>)> {
        let slot = self.cursor.fetch_add(1, Ordering::SeqCst);
        let scene = self.scenes.get(slot)?;
        Some((scene, self.seeds.get(slot).copied().flatten()))
    }
}

impl GenerationPipeline {
    /// Builds a pipeline without a durable cache.
    pub fn new(
        images: Arc<dyn ImageGenerator>,
        rewriter: PromptRewriter,
        vocabulary: ErrorVocabulary,
        settings: PipelineSettings,
    ) -> Self {
        let concurrency = settings.concurrency();
        let generator = SceneGenerator::new(
            images,
            rewriter,
            vocabulary,
            settings.retry,
            settings.aspect_ratio,
        );
        Self {
            generator,
            concurrency,
            cache: None,
            progress: Arc::new(ProgressAggregator::new()),
            signal: Mutex::new(StopSignal::new()),
            running: AtomicBool::new(false),
        }
    }

    /// Persists finished images to, and restores them from, `db`.
    pub fn with_cache(mut self, db: DatabaseConnection) -> Self {
        self.cache = Some(db);
        self
    }

    /// Workers per run.
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Live view of the run state.
    pub fn subscribe(&self) -> watch::Receiver<GenerationState> {
        self.progress.subscribe()
    }

    /// Copy of the current run state.
    pub fn snapshot(&self) -> GenerationState {
        self.progress.snapshot()
    }

    /// Forgets the last run's state.
    pub fn clear(&self) {
        self.progress.clear();
    }

    /// Asks the active run to stop. Requests already in flight finish.
    pub fn cancel(&self) {
        self.current_signal().cancel();
    }

    fn current_signal(&self) -> StopSignal {
        self.signal
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn reset_signal(&self) -> StopSignal {
        let signal = StopSignal::new();
        *self
            .signal
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = signal.clone();
        signal
    }

    async fn restore_cached(&self, scenes: &mut [Scene]) {
        let Some(db) = &self.cache else {
            return;
        };
        let cached = match scene_images::load_all(db).await {
            Ok(cached) => cached,
            Err(err) => {
                warn!("Couldn't read the image cache, generating everything: {err}");
                return;
            }
        };
        for scene in scenes.iter_mut().filter(|scene| !scene.has_image()) {
            let Some(image) = cached.get(&scene.number) else {
                continue;
            };
            if image.source_prompt != scene.prompt {
                debug!(
                    "Cached image for scene {} belongs to a different prompt, regenerating",
                    scene.number
                );
                continue;
            }
            debug!("Scene {} restored from cache", scene.number);
            scene.image_url = Some(image.image_url.clone());
            scene.prompt = image.prompt.clone();
        }
    }

    /// Generates images for every scene that lacks one.
    ///
    /// Only one run per pipeline at a time; a call made while another is
    /// active fails with [`ScenegenError::RunInProgress`] and leaves the
    /// active run untouched.
    pub async fn run(
        &self,
        mut scenes: Vec<Scene>,
        characters: &[CharacterDescriptor],
    ) -> Result<RunReport, ScenegenError> {
        let Some(_claim) = RunClaim::acquire(&self.running) else {
            warn!("Refusing to start a run while another is in progress");
            return Err(ScenegenError::RunInProgress);
        };
        let signal = self.reset_signal();
        self.restore_cached(&mut scenes).await;

        let queued: Vec<Scene> = scenes
            .iter()
            .filter(|scene| !scene.has_image())
            .cloned()
            .collect();
        let seeds = queued
            .iter()
            .map(|scene| seed_for(characters, scene.character_name.as_deref()))
            .collect();
        self.progress.begin_run(scenes, queued.len());

        let workers = self.concurrency.min(queued.len());
        info!(
            "Generating {} images with {workers} workers",
            queued.len()
        );
        let queue = Arc::new(RunQueue {
            scenes: queued,
            seeds,
            cursor: AtomicUsize::new(0),
        });

        let mut pool = JoinSet::new();
        for worker in 0..workers {
            pool.spawn(run_worker(
                worker,
                queue.clone(),
                self.generator.clone(),
                self.progress.clone(),
                signal.clone(),
                self.cache.clone(),
            ));
        }
        while let Some(joined) = pool.join_next().await {
            if let Err(err) = joined {
                error!("Generation worker stopped unexpectedly: {err}");
            }
        }

        let auth_error = self.progress.snapshot().auth_error;
        let stats = self.progress.finish();
        let outcome = if let Some(message) = auth_error {
            RunOutcome::AuthenticationFailed { message }
        } else if signal.is_cancelled() && stats.completed + stats.failed < stats.total {
            RunOutcome::Cancelled {
                completed: stats.completed,
                failed: stats.failed,
            }
        } else if stats.failed == 0 {
            RunOutcome::Success
        } else {
            RunOutcome::PartialSuccess {
                failed: stats.failed,
                rate_limited: stats.rate_limit_hit,
            }
        };
        info!("{}", outcome.summary(&stats));

        Ok(RunReport {
            outcome,
            stats,
            scenes: self.progress.snapshot().scenes,
        })
    }
}

async fn run_worker(
    worker: usize,
    queue: Arc<RunQueue>,
    generator: SceneGenerator,
    progress: Arc<ProgressAggregator>,
    signal: StopSignal,
    cache: Option<DatabaseConnection>,
) {
    debug!("Worker {worker} started");
    while !signal.should_stop() {
        let Some((scene, seed)) = queue.claim() else {
            break;
        };
        progress.claim(scene.number, &scene.prompt);

        match generator.generate(scene, seed, &progress, &signal).await {
            ItemOutcome::Success {
                image_url,
                rewritten_prompt,
            } => {
                progress.succeed(scene.number, &image_url, rewritten_prompt.as_deref());
                if let Some(db) = &cache {
                    let entry = scene_images::CachedImage {
                        source_prompt: scene.prompt.clone(),
                        image_url,
                        prompt: rewritten_prompt.unwrap_or_else(|| scene.prompt.clone()),
                    };
                    if let Err(err) = scene_images::store(db, scene.number, &entry).await {
                        warn!("Couldn't cache image for scene {}: {err}", scene.number);
                    }
                }
            }
            ItemOutcome::Failed {
                rate_limited,
                last_error,
            } => {
                warn!("Scene {} failed: {last_error}", scene.number);
                progress.fail(scene.number, rate_limited);
            }
            ItemOutcome::AuthError(message) => {
                error!("Scene {}: authentication failed, aborting run", scene.number);
                progress.record_auth_error(&message);
                signal.abort();
            }
            ItemOutcome::Interrupted => {
                debug!("Worker {worker} interrupted on scene {}", scene.number);
            }
        }
    }
    debug!("Worker {worker} finished");
}

