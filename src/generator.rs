//! Generation of a single scene image, with retries.
//!
//! Each call walks one scene through request → classify → (retry | rewrite |
//! give up) until it succeeds, runs out of budget, or hits an auth failure.
//! Retries of one scene are strictly sequential.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::classify::{ErrorKind, ErrorVocabulary};
use crate::client::{ImageGenerator, ImageRequest};
use crate::constants::{
    IMAGES_PER_REQUEST, MAX_RETRIES, MAX_REWRITE_ATTEMPTS, RATE_LIMIT_BACKOFF_BASE,
    RATE_LIMIT_BACKOFF_INCREMENT, REWRITE_DELAY, TRANSIENT_BACKOFF_BASE,
    TRANSIENT_BACKOFF_INCREMENT,
};
use crate::progress::ProgressAggregator;
use crate::rewriter::PromptRewriter;
use crate::scene::Scene;
use crate::signal::StopSignal;

/// Retry budget and back-off timings for one scene.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Retries allowed for rate-limited and transient failures
    pub max_retries: u32,
    /// Rewrites allowed for content-blocked prompts
    pub max_rewrite_attempts: u32,
    /// First rate limit back-off
    pub rate_limit_base: Duration,
    /// Extra rate limit back-off per retry spent
    pub rate_limit_increment: Duration,
    /// First transient back-off
    pub transient_base: Duration,
    /// Extra transient back-off per retry spent
    pub transient_increment: Duration,
    /// Pause after a successful rewrite
    pub rewrite_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            max_rewrite_attempts: MAX_REWRITE_ATTEMPTS,
            rate_limit_base: RATE_LIMIT_BACKOFF_BASE,
            rate_limit_increment: RATE_LIMIT_BACKOFF_INCREMENT,
            transient_base: TRANSIENT_BACKOFF_BASE,
            transient_increment: TRANSIENT_BACKOFF_INCREMENT,
            rewrite_delay: REWRITE_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Back-off before rate limit retry number `retries + 1`.
    pub fn rate_limit_backoff(&self, retries: u32) -> Duration {
        self.rate_limit_base + self.rate_limit_increment * retries
    }

    /// Back-off before transient retry number `retries + 1`.
    pub fn transient_backoff(&self, retries: u32) -> Duration {
        self.transient_base + self.transient_increment * retries
    }
}

/// How one scene ended.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ItemOutcome {
    /// Image generated. `rewritten_prompt` is set if the prompt had to change.
    Success {
        /// Where the image lives
        image_url: String,
        /// Replacement prompt that got through, if any
        rewritten_prompt: Option<String>,
    },
    /// Retry budget spent.
    Failed {
        /// The last failure was a rate limit
        rate_limited: bool,
        /// Last upstream message
        last_error: String,
    },
    /// Upstream credential rejected; the whole run must stop.
    AuthError(String),
    /// Cancelled or aborted before finishing.
    Interrupted,
}

/// Runs the per-scene retry state machine.
#[derive(Clone)]
pub struct SceneGenerator {
    images: Arc<dyn ImageGenerator>,
    rewriter: PromptRewriter,
    vocabulary: ErrorVocabulary,
    policy: RetryPolicy,
    aspect_ratio: String,
}

impl SceneGenerator {
    /// Builds a generator.
    pub fn new(
        images: Arc<dyn ImageGenerator>,
        rewriter: PromptRewriter,
        vocabulary: ErrorVocabulary,
        policy: RetryPolicy,
        aspect_ratio: impl Into<String>,
    ) -> Self {
        Self {
            images,
            rewriter,
            vocabulary,
            policy,
            aspect_ratio: aspect_ratio.into(),
        }
    }

    /// The retry policy in use.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Generates the image for `scene`, reporting rewrites to `progress`.
    pub async fn generate(
        &self,
        scene: &Scene,
        seed: Option<i64>,
        progress: &ProgressAggregator,
        signal: &StopSignal,
    ) -> ItemOutcome {
        let number = scene.number;
        let original = scene.prompt.as_str();
        let mut prompt = scene.prompt.clone();
        let mut rewritten = false;
        let mut retries = 0u32;
        let mut rewrites = 0u32;

        loop {
            if signal.should_stop() {
                return ItemOutcome::Interrupted;
            }

            let request = ImageRequest {
                prompt: prompt.clone(),
                aspect_ratio: self.aspect_ratio.clone(),
                number_of_images: IMAGES_PER_REQUEST,
                seed,
                scene_index: Some(number),
            };
            let err = match self.images.generate(&request).await {
                Ok(image_url) => {
                    debug!("Scene {number} generated after {retries} retries, {rewrites} rewrites");
                    return ItemOutcome::Success {
                        image_url,
                        rewritten_prompt: rewritten.then_some(prompt),
                    };
                }
                Err(err) => err,
            };

            let kind = self.vocabulary.classify(err.status, &err.message);
            if kind == ErrorKind::Auth {
                warn!("Scene {number}: upstream rejected credentials: {err}");
                return ItemOutcome::AuthError(err.message);
            }

            if kind == ErrorKind::ContentBlocked && rewrites < self.policy.max_rewrite_attempts {
                rewrites += 1;
                info!(
                    "Scene {number}: prompt blocked, rewriting ({rewrites}/{})",
                    self.policy.max_rewrite_attempts
                );
                progress.rewrite_start(number, original, rewrites);
                let replacement = self.rewriter.rewrite(original, &scene.text, rewrites).await;
                if let Some(new_prompt) = replacement {
                    progress.rewrite_update(number, &new_prompt);
                    prompt = new_prompt;
                    rewritten = true;
                    let carry_on = signal.sleep(self.policy.rewrite_delay).await;
                    progress.rewrite_clear(number);
                    if !carry_on {
                        return ItemOutcome::Interrupted;
                    }
                    continue;
                }
                progress.rewrite_clear(number);
            }

            let rate_limited = kind == ErrorKind::RateLimited;
            if retries >= self.policy.max_retries {
                warn!("Scene {number}: giving up after {retries} retries: {err}");
                return ItemOutcome::Failed {
                    rate_limited,
                    last_error: err.message,
                };
            }

            let delay = if rate_limited {
                self.policy.rate_limit_backoff(retries)
            } else {
                self.policy.transient_backoff(retries)
            };
            retries += 1;
            info!(
                "Scene {number}: {:?} ({err}), retry {retries}/{} in {:.1}s",
                kind,
                self.policy.max_retries,
                delay.as_secs_f64()
            );
            if !signal.sleep(delay).await {
                return ItemOutcome::Interrupted;
            }
        }
    }
}
