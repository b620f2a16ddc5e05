//! Live run state shared between the workers and whoever is watching.
//!
//! Every change goes through [`ProgressAggregator::update`], which applies a
//! closure to the latest state under the channel's lock. Workers never write a
//! stale copy back, so one worker's failure can't erase another's completion.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::scene::Scene;

/// Which scene is currently having its prompt rewritten, if any.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RewriteProgress {
    /// A rewrite is in flight
    pub is_rewriting: bool,
    /// Scene being rewritten
    pub scene_number: Option<u32>,
    /// The prompt that was blocked
    pub original_prompt: Option<String>,
    /// Replacement, once the backend produced one
    pub new_prompt: Option<String>,
    /// 1-based rewrite attempt
    pub attempt: u32,
}

/// Aggregate state of a generation run.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GenerationState {
    /// A run is active
    pub is_generating: bool,
    /// Scenes queued for this run
    pub total_images: usize,
    /// Scenes that got an image
    pub completed_images: usize,
    /// Scenes that gave up
    pub failed_images: usize,
    /// Scene numbers that gave up, in the order they failed
    pub failed_indexes: Vec<u32>,
    /// At least one scene gave up because of rate limiting
    pub rate_limit_hit: bool,
    /// Most recently claimed scene
    pub current_index: Option<u32>,
    /// Prompt of the most recently claimed scene
    pub current_prompt: Option<String>,
    /// When the run started
    pub start_time: Option<DateTime<Utc>>,
    /// All scenes of the run, updated as images arrive
    pub scenes: Vec<Scene>,
    /// Rewrite in progress
    pub rewrite: RewriteProgress,
    /// Set when the upstream rejected our credential
    pub auth_error: Option<String>,
}

/// Final numbers for a finished run.
#[derive(Clone, Debug, PartialEq)]
pub struct RunStats {
    /// Scenes queued
    pub total: usize,
    /// Scenes that got an image
    pub completed: usize,
    /// Scenes that gave up
    pub failed: usize,
    /// Scene numbers that gave up
    pub failed_indexes: Vec<u32>,
    /// Some failure was a rate limit
    pub rate_limit_hit: bool,
    /// Wall clock time since the run started
    pub elapsed: Duration,
    /// Completed scenes per minute
    pub items_per_minute: f64,
}

/// Owner of the [`GenerationState`]; hands out receivers to observers.
#[derive(Debug)]
pub struct ProgressAggregator {
    state: watch::Sender<GenerationState>,
}

impl Default for ProgressAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressAggregator {
    /// Starts with an empty, idle state.
    pub fn new() -> Self {
        Self {
            state: watch::Sender::new(GenerationState::default()),
        }
    }

    /// A receiver that sees every update.
    pub fn subscribe(&self) -> watch::Receiver<GenerationState> {
        self.state.subscribe()
    }

    /// Copy of the latest state.
    pub fn snapshot(&self) -> GenerationState {
        self.state.borrow().clone()
    }

    /// Applies `change` to the latest state and notifies observers.
    pub fn update(&self, change: impl FnOnce(&mut GenerationState)) {
        self.state.send_modify(change);
    }

    /// Resets the state for a new run over `scenes`, `queued` of which need images.
    pub fn begin_run(&self, scenes: Vec<Scene>, queued: usize) {
        self.update(|state| {
            *state = GenerationState {
                is_generating: true,
                total_images: queued,
                start_time: Some(Utc::now()),
                scenes,
                ..GenerationState::default()
            };
        });
    }

    /// A worker took a scene off the queue.
    pub fn claim(&self, scene_number: u32, prompt: &str) {
        self.update(|state| {
            state.current_index = Some(scene_number);
            state.current_prompt = Some(prompt.to_string());
        });
    }

    /// A scene got its image.
    pub fn succeed(&self, scene_number: u32, image_url: &str, rewritten_prompt: Option<&str>) {
        self.update(|state| {
            state.completed_images += 1;
            if let Some(scene) = state
                .scenes
                .iter_mut()
                .find(|scene| scene.number == scene_number)
            {
                scene.image_url = Some(image_url.to_string());
                if let Some(prompt) = rewritten_prompt {
                    scene.prompt = prompt.to_string();
                }
            }
        });
    }

    /// A scene gave up.
    pub fn fail(&self, scene_number: u32, rate_limited: bool) {
        self.update(|state| {
            state.failed_images += 1;
            state.failed_indexes.push(scene_number);
            state.rate_limit_hit |= rate_limited;
        });
    }

    /// A blocked prompt is being sent for rewriting.
    pub fn rewrite_start(&self, scene_number: u32, original_prompt: &str, attempt: u32) {
        self.update(|state| {
            state.rewrite = RewriteProgress {
                is_rewriting: true,
                scene_number: Some(scene_number),
                original_prompt: Some(original_prompt.to_string()),
                new_prompt: None,
                attempt,
            };
        });
    }

    /// The rewrite for `scene_number` produced `new_prompt`.
    pub fn rewrite_update(&self, scene_number: u32, new_prompt: &str) {
        self.update(|state| {
            if state.rewrite.scene_number == Some(scene_number) {
                state.rewrite.new_prompt = Some(new_prompt.to_string());
            }
        });
    }

    /// Clears the rewrite record, unless another scene has taken it over since.
    pub fn rewrite_clear(&self, scene_number: u32) {
        self.update(|state| {
            if state.rewrite.scene_number == Some(scene_number) {
                state.rewrite = RewriteProgress::default();
            }
        });
    }

    /// The upstream credential was rejected.
    pub fn record_auth_error(&self, message: &str) {
        self.update(|state| {
            state.auth_error.get_or_insert_with(|| message.to_string());
        });
    }

    /// Computes final stats and drops the per-run transient fields, keeping `scenes`.
    pub fn finish(&self) -> RunStats {
        let mut stats = None;
        self.update(|state| {
            let elapsed = state
                .start_time
                .and_then(|start| (Utc::now() - start).to_std().ok())
                .unwrap_or_default();
            stats = Some(RunStats {
                total: state.total_images,
                completed: state.completed_images,
                failed: state.failed_images,
                failed_indexes: state.failed_indexes.clone(),
                rate_limit_hit: state.rate_limit_hit,
                elapsed,
                items_per_minute: items_per_minute(state.completed_images, elapsed),
            });
            state.is_generating = false;
            state.current_index = None;
            state.current_prompt = None;
            state.start_time = None;
            state.rewrite = RewriteProgress::default();
        });
        stats.unwrap_or_else(|| RunStats {
            total: 0,
            completed: 0,
            failed: 0,
            failed_indexes: Vec::new(),
            rate_limit_hit: false,
            elapsed: Duration::ZERO,
            items_per_minute: 0.0,
        })
    }

    /// Drops everything, including scenes.
    pub fn clear(&self) {
        self.update(|state| *state = GenerationState::default());
    }
}

fn items_per_minute(completed: usize, elapsed: Duration) -> f64 {
    let minutes = elapsed.as_secs_f64() / 60.0;
    if minutes <= f64::EPSILON {
        0.0
    } else {
        completed as f64 / minutes
    }
}
