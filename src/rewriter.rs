//! Rewrites prompts that the image endpoint refused on safety grounds.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::client::{RewriteBackend, RewriteRequest};

/// How aggressively a blocked prompt gets sanitized.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RewriteStrategy {
    /// Keep the composition and mood, drop the sensitive details.
    PreserveEssence,
    /// Replace people and actions with abstract, atmospheric imagery.
    AbstractAtmosphere,
}

impl RewriteStrategy {
    /// First attempt preserves the scene; every later attempt goes abstract.
    pub fn for_attempt(attempt: u32) -> Self {
        if attempt <= 1 {
            Self::PreserveEssence
        } else {
            Self::AbstractAtmosphere
        }
    }

    /// Instruction sent as the system prompt.
    pub fn instruction(self, directive: &str) -> String {
        let body = match self {
            Self::PreserveEssence => {
                r#"You rewrite image generation prompts that were rejected by a content safety filter.

Rules:
- Keep the setting, composition, lighting, colours and emotional tone.
- Remove or soften violence, weapons, blood, injuries, nudity, drugs and any named real person.
- Describe people by clothing and posture, never by age or body.
- Keep it a single paragraph in English.
- Return only the new prompt, no commentary."#
            }
            Self::AbstractAtmosphere => {
                r#"You rewrite image generation prompts that were rejected by a content safety filter several times.

Rules:
- Do not depict people, faces or bodies at all.
- Replace every action with an atmospheric equivalent: landscapes, weather, light, objects, symbols, silhouettes at a distance.
- Convey the emotion of the narration through colour, light and environment only.
- Keep it a single paragraph in English.
- Return only the new prompt, no commentary."#
            }
        };
        format!("{body}\n- The prompt must end with: {directive}")
    }
}

/// Lowercased words of `text`, split on anything but letters, digits and `:`.
fn words(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !(c.is_alphanumeric() || c == ':'))
        .filter(|word| !word.is_empty())
        .map(str::to_lowercase)
}

/// The ratio and size tokens of a directive, e.g. `16:9` and `1920x1080`.
fn measurements(directive: &str) -> Vec<String> {
    words(directive)
        .filter(|word| word.chars().any(|c| c.is_ascii_digit()))
        .collect()
}

/// Makes sure a prompt states the output size/aspect directive, appending it if absent.
///
/// A prompt counts as already carrying the directive when it contains the
/// directive verbatim, or every ratio and size token of it. Other ratios,
/// sizes or times of day don't count.
pub fn ensure_directive(prompt: &str, directive: &str) -> String {
    let prompt = prompt.trim();
    let required = measurements(directive);
    let already_there = prompt.to_lowercase().contains(&directive.to_lowercase())
        || (!required.is_empty() && {
            let present: Vec<String> = words(prompt).collect();
            required.iter().all(|token| present.contains(token))
        });
    if already_there || directive.is_empty() {
        return prompt.to_string();
    }
    let separator = if prompt.ends_with(['.', ',', ';']) { " " } else { ", " };
    format!("{prompt}{separator}{directive}")
}

fn clean_completion(text: &str) -> Option<String> {
    let text = text.trim();
    let text = text
        .strip_prefix("Prompt:")
        .or_else(|| text.strip_prefix("prompt:"))
        .unwrap_or(text)
        .trim();
    let text = text
        .trim_matches(|c: char| matches!(c, '"' | '\'' | '`' | '“' | '”'))
        .trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

/// Asks a text backend for a safer version of a blocked prompt.
#[derive(Clone)]
pub struct PromptRewriter {
    backend: Arc<dyn RewriteBackend>,
    directive: String,
}

impl PromptRewriter {
    /// Builds a rewriter that guarantees `directive` on every result.
    pub fn new(backend: Arc<dyn RewriteBackend>, directive: impl Into<String>) -> Self {
        Self {
            backend,
            directive: directive.into(),
        }
    }

    /// Returns the replacement prompt, or `None` if the rewrite failed for any reason.
    pub async fn rewrite(
        &self,
        blocked_prompt: &str,
        source_text: &str,
        attempt: u32,
    ) -> Option<String> {
        let strategy = RewriteStrategy::for_attempt(attempt);
        debug!("Rewriting prompt, attempt {attempt} using {strategy:?}");
        let request = RewriteRequest {
            system: strategy.instruction(&self.directive),
            prompt: blocked_prompt.to_string(),
            source_text: source_text.to_string(),
        };

        let completion = match self.backend.complete(&request).await {
            Ok(completion) => completion,
            Err(err) => {
                warn!("Prompt rewrite attempt {attempt} failed: {err}");
                return None;
            }
        };
        let Some(cleaned) = clean_completion(&completion) else {
            warn!("Prompt rewrite attempt {attempt} returned an empty prompt");
            return None;
        };
        Some(ensure_directive(&cleaned, &self.directive))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::UpstreamError;
    use async_trait::async_trait;
    use std::sync::Mutex;

    const DIRECTIVE: &str = "16:9 aspect ratio, 1920x1080 resolution";

    struct ScriptedBackend {
        reply: Result<String, UpstreamError>,
        seen: Mutex<Vec<RewriteRequest>>,
    }

    #[async_trait]
    impl RewriteBackend for ScriptedBackend {
        async fn complete(&self, request: &RewriteRequest) -> Result<String, UpstreamError> {
            self.seen.lock().expect("lock").push(request.clone());
            self.reply.clone()
        }
    }

    fn scripted(reply: Result<String, UpstreamError>) -> (PromptRewriter, Arc<ScriptedBackend>) {
        let backend = Arc::new(ScriptedBackend {
            reply,
            seen: Mutex::new(Vec::new()),
        });
        (PromptRewriter::new(backend.clone(), DIRECTIVE), backend)
    }

    #[test]
    fn strategy_is_chosen_by_attempt() {
        assert_eq!(RewriteStrategy::for_attempt(0), RewriteStrategy::PreserveEssence);
        assert_eq!(RewriteStrategy::for_attempt(1), RewriteStrategy::PreserveEssence);
        assert_eq!(RewriteStrategy::for_attempt(2), RewriteStrategy::AbstractAtmosphere);
        assert_eq!(RewriteStrategy::for_attempt(9), RewriteStrategy::AbstractAtmosphere);
    }

    #[test]
    fn directive_is_appended_once() {
        assert_eq!(
            ensure_directive("a misty harbour at dawn", DIRECTIVE),
            format!("a misty harbour at dawn, {DIRECTIVE}")
        );
        assert_eq!(
            ensure_directive("a misty harbour at dawn.", DIRECTIVE),
            format!("a misty harbour at dawn. {DIRECTIVE}")
        );
        assert_eq!(
            ensure_directive("wide shot, 16:9 at 1920x1080, cinematic", DIRECTIVE),
            "wide shot, 16:9 at 1920x1080, cinematic"
        );
        assert_eq!(
            ensure_directive(&format!("a harbour, {}", DIRECTIVE.to_uppercase()), DIRECTIVE),
            format!("a harbour, {}", DIRECTIVE.to_uppercase())
        );
    }

    #[test]
    fn other_ratios_and_times_do_not_count_as_the_directive() {
        assert_eq!(
            ensure_directive("a clock tower striking 10:30 in the rain", DIRECTIVE),
            format!("a clock tower striking 10:30 in the rain, {DIRECTIVE}")
        );
        assert_eq!(
            ensure_directive("a portrait poster, 4:5, 1080x1350", DIRECTIVE),
            format!("a portrait poster, 4:5, 1080x1350, {DIRECTIVE}")
        );
        assert_eq!(
            ensure_directive("wide shot, 16:9, cinematic", DIRECTIVE),
            format!("wide shot, 16:9, cinematic, {DIRECTIVE}")
        );
        assert_eq!(
            ensure_directive("a 16:90 banner at 19201x1080", DIRECTIVE),
            format!("a 16:90 banner at 19201x1080, {DIRECTIVE}")
        );
    }

    #[test]
    fn directive_tokens_are_ratio_and_size() {
        assert_eq!(measurements(DIRECTIVE), vec!["16:9", "1920x1080"]);
        assert!(measurements("cinematic lighting").is_empty());
    }

    #[tokio::test]
    async fn rewrite_cleans_and_adds_directive() {
        let (rewriter, backend) = scripted(Ok("  \"An empty street under rain\"  ".to_string()));
        let rewritten = rewriter
            .rewrite("a bloody fight in the street", "They fought.", 1)
            .await;
        assert_eq!(
            rewritten.as_deref(),
            Some("An empty street under rain, 16:9 aspect ratio, 1920x1080 resolution")
        );

        let seen = backend.seen.lock().expect("lock");
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].prompt, "a bloody fight in the street");
        assert_eq!(seen[0].source_text, "They fought.");
        assert_eq!(
            seen[0].system,
            RewriteStrategy::PreserveEssence.instruction(DIRECTIVE)
        );
    }

    #[tokio::test]
    async fn second_attempt_goes_abstract() {
        let (rewriter, backend) = scripted(Ok("storm clouds over a city".to_string()));
        rewriter.rewrite("blocked", "text", 2).await;
        let seen = backend.seen.lock().expect("lock");
        assert_eq!(
            seen[0].system,
            RewriteStrategy::AbstractAtmosphere.instruction(DIRECTIVE)
        );
    }

    #[tokio::test]
    async fn failures_return_none() {
        let (rewriter, _) = scripted(Err(UpstreamError::new("connection refused")));
        assert_eq!(rewriter.rewrite("blocked", "text", 1).await, None);

        let (rewriter, _) = scripted(Ok("  \"\" ".to_string()));
        assert_eq!(rewriter.rewrite("blocked", "text", 1).await, None);
    }
}
