//! CLI parser
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::constants::{
    DEFAULT_ASPECT_RATIO, DEFAULT_DATABASE_PATH, DEFAULT_OUTPUT_DIRECTIVE,
    DEFAULT_REQUESTS_PER_COOKIE, MAX_RETRIES, MAX_REWRITE_ATTEMPTS,
};
use crate::generator::RetryPolicy;
use crate::pipeline::PipelineSettings;

#[derive(Parser, Debug)]
#[command(name = "scenegen")]
/// Generate an image for every scene in a script
pub struct CliOptions {
    /// JSON file with the scenes to illustrate
    pub scenes: PathBuf,

    #[clap(long, help = "Enable debug logging", env = "SCENEGEN_DEBUG")]
    /// Enable debug logging. Env: SCENEGEN_DEBUG
    pub debug: bool,

    #[clap(long, short, env = "SCENEGEN_CHARACTERS")]
    /// JSON file with character descriptors, for stable seeds.
    /// Env: SCENEGEN_CHARACTERS
    pub characters: Option<PathBuf>,

    #[clap(long, short, default_value = "scenes.generated.json", env = "SCENEGEN_OUTPUT")]
    /// Where to write the scenes with their images.
    /// Env: SCENEGEN_OUTPUT
    pub output: PathBuf,

    #[clap(long, env = "SCENEGEN_IMAGE_ENDPOINT")]
    /// Image generation function URL.
    /// Env: SCENEGEN_IMAGE_ENDPOINT
    pub image_endpoint: String,

    #[clap(long, env = "SCENEGEN_REWRITE_ENDPOINT")]
    /// Prompt rewrite function URL.
    /// Env: SCENEGEN_REWRITE_ENDPOINT
    pub rewrite_endpoint: String,

    #[clap(long, env = "SCENEGEN_API_KEY", hide_env_values = true)]
    /// Bearer credential for both endpoints.
    /// Env: SCENEGEN_API_KEY
    pub api_key: Option<String>,

    #[clap(long, default_value = "1", env = "SCENEGEN_COOKIE_COUNT")]
    /// Upstream credentials the endpoint rotates through.
    /// Env: SCENEGEN_COOKIE_COUNT
    pub cookie_count: usize,

    #[clap(long, default_value_t = DEFAULT_REQUESTS_PER_COOKIE, env = "SCENEGEN_REQUESTS_PER_COOKIE")]
    /// Concurrent requests per credential.
    /// Env: SCENEGEN_REQUESTS_PER_COOKIE
    pub requests_per_cookie: usize,

    #[clap(long, default_value_t = MAX_RETRIES, env = "SCENEGEN_MAX_RETRIES")]
    /// Retries per scene for rate limits and transient errors.
    /// Env: SCENEGEN_MAX_RETRIES
    pub max_retries: u32,

    #[clap(long, default_value_t = MAX_REWRITE_ATTEMPTS, env = "SCENEGEN_MAX_REWRITES")]
    /// Prompt rewrites per scene for blocked content.
    /// Env: SCENEGEN_MAX_REWRITES
    pub max_rewrites: u32,

    #[clap(long, default_value = "120", env = "SCENEGEN_REQUEST_TIMEOUT")]
    /// Per-request timeout in seconds.
    /// Env: SCENEGEN_REQUEST_TIMEOUT
    pub request_timeout: u64,

    #[clap(long, default_value = DEFAULT_ASPECT_RATIO, env = "SCENEGEN_ASPECT_RATIO")]
    /// Aspect ratio requested for every image.
    /// Env: SCENEGEN_ASPECT_RATIO
    pub aspect_ratio: String,

    #[clap(long, default_value = DEFAULT_OUTPUT_DIRECTIVE, env = "SCENEGEN_OUTPUT_DIRECTIVE")]
    /// Size directive every rewritten prompt must carry.
    /// Env: SCENEGEN_OUTPUT_DIRECTIVE
    pub output_directive: String,

    #[clap(long, env = "SCENEGEN_ERROR_VOCABULARY")]
    /// JSON file replacing the built-in upstream error markers.
    /// Env: SCENEGEN_ERROR_VOCABULARY
    pub error_vocabulary: Option<PathBuf>,

    #[clap(long, default_value = DEFAULT_DATABASE_PATH, env = "SCENEGEN_DATABASE_PATH")]
    /// Path to the image cache database, eg `/data/scenegen.sqlite`.
    /// Env: SCENEGEN_DATABASE_PATH
    pub database_path: String,

    #[clap(long, env = "SCENEGEN_NO_CACHE")]
    /// Don't read or write the image cache.
    /// Env: SCENEGEN_NO_CACHE
    pub no_cache: bool,
}

impl CliOptions {
    /// Per-request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout.max(1))
    }

    /// Pipeline settings from the options, default timings otherwise.
    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            cookie_count: self.cookie_count,
            requests_per_cookie: self.requests_per_cookie,
            retry: RetryPolicy {
                max_retries: self.max_retries,
                max_rewrite_attempts: self.max_rewrites,
                ..RetryPolicy::default()
            },
            aspect_ratio: self.aspect_ratio.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_from_arguments() {
        let cli = CliOptions::parse_from([
            "scenegen",
            "scenes.json",
            "--image-endpoint",
            "http://localhost:9000/generate-image",
            "--rewrite-endpoint",
            "http://localhost:9000/rewrite-prompt",
            "--cookie-count",
            "3",
            "--max-retries",
            "5",
        ]);
        let settings = cli.pipeline_settings();
        assert_eq!(settings.concurrency(), 3 * DEFAULT_REQUESTS_PER_COOKIE);
        assert_eq!(settings.retry.max_retries, 5);
        assert_eq!(settings.retry.max_rewrite_attempts, MAX_REWRITE_ATTEMPTS);
        assert_eq!(settings.aspect_ratio, DEFAULT_ASPECT_RATIO);
        assert_eq!(cli.request_timeout(), Duration::from_secs(120));
        assert!(!cli.no_cache);
    }

    #[test]
    fn zero_cookies_still_gets_workers() {
        let cli = CliOptions::parse_from([
            "scenegen",
            "scenes.json",
            "--image-endpoint",
            "http://localhost/a",
            "--rewrite-endpoint",
            "http://localhost/b",
            "--cookie-count",
            "0",
            "--requests-per-cookie",
            "0",
        ]);
        assert_eq!(cli.pipeline_settings().concurrency(), 1);
    }
}
