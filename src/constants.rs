//! Shared constants/defaults for the generation pipeline
//!

use std::time::Duration;

/// Default file name for the durable scene image cache
pub const DEFAULT_DATABASE_PATH: &str = "scenegen.sqlite";

/// Aspect ratio sent with every image request.
pub const DEFAULT_ASPECT_RATIO: &str = "16:9";

/// Directive every rewritten prompt must carry.
pub const DEFAULT_OUTPUT_DIRECTIVE: &str = "16:9 aspect ratio, 1920x1080 resolution";

/// Images requested per scene.
pub const IMAGES_PER_REQUEST: u8 = 1;

/// Concurrent requests allowed per upstream credential ("cookie").
pub const DEFAULT_REQUESTS_PER_COOKIE: usize = 2;

/// Retry bound for rate-limited and transient failures of a single scene.
pub const MAX_RETRIES: u32 = 3;

/// Rewrite bound for content-blocked prompts of a single scene.
pub const MAX_REWRITE_ATTEMPTS: u32 = 3;

/// First back-off after a rate limit.
pub const RATE_LIMIT_BACKOFF_BASE: Duration = Duration::from_secs(5);

/// Added to the rate limit back-off for every retry already spent.
pub const RATE_LIMIT_BACKOFF_INCREMENT: Duration = Duration::from_secs(5);

/// First back-off after a transient failure.
pub const TRANSIENT_BACKOFF_BASE: Duration = Duration::from_secs(2);

/// Added to the transient back-off for every retry already spent.
pub const TRANSIENT_BACKOFF_INCREMENT: Duration = Duration::from_secs(2);

/// Pause between a successful rewrite and the resubmission.
pub const REWRITE_DELAY: Duration = Duration::from_secs(1);

/// Upper bound on a single upstream call.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
