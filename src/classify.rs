//! Classification of upstream failures.
//!
//! The image endpoint doesn't return structured error codes, so failures are
//! sorted by matching marker phrases in the status and message. The phrases
//! are upstream wording we don't control; they live in [`ErrorVocabulary`]
//! so they can be swapped without a rebuild.

use serde::{Deserialize, Serialize};

/// What a failed upstream call means for the retry loop.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// Too many requests; back off and retry.
    RateLimited,
    /// The prompt was rejected by a safety filter; rewrite and retry.
    ContentBlocked,
    /// Anything else; back off and retry.
    Transient,
    /// The upstream credential is no longer valid. Fatal for the whole run.
    Auth,
}

/// Marker phrases, matched case-insensitively as substrings.
#[derive(Clone, Debug, Deserialize, Serialize, Eq, PartialEq)]
pub struct ErrorVocabulary {
    /// Credential or session problems
    #[serde(default)]
    pub auth_markers: Vec<String>,
    /// Throttling
    #[serde(default)]
    pub rate_limit_markers: Vec<String>,
    /// Safety and policy rejections
    #[serde(default)]
    pub content_block_markers: Vec<String>,
}

impl Default for ErrorVocabulary {
    fn default() -> Self {
        fn owned(markers: &[&str]) -> Vec<String> {
            markers.iter().map(|marker| marker.to_string()).collect()
        }

        Self {
            auth_markers: owned(&[
                "unauthorized",
                "unauthenticated",
                "invalid credentials",
                "invalid cookie",
                "cookie expired",
                "session expired",
                "token expired",
                "authentication",
                "não autorizado",
                "sessão expirada",
                "credenciais inválidas",
                "autenticação",
            ]),
            rate_limit_markers: owned(&[
                "rate limit",
                "rate_limit",
                "ratelimit",
                "too many requests",
                "resource_exhausted",
                "quota exceeded",
                "limite de taxa",
                "limite de requisições",
                "muitas requisições",
                "muitas solicitações",
            ]),
            content_block_markers: owned(&[
                "safety",
                "content policy",
                "policy violation",
                "blocked",
                "unsafe content",
                "filtered_content",
                "prohibited",
                "conteúdo bloqueado",
                "política de conteúdo",
                "bloqueado",
                "inapropriado",
                "segurança",
            ]),
        }
    }
}

impl ErrorVocabulary {
    /// True when no marker of any kind is configured.
    pub fn is_empty(&self) -> bool {
        self.auth_markers.is_empty()
            && self.rate_limit_markers.is_empty()
            && self.content_block_markers.is_empty()
    }

    /// Maps an upstream status and message to an [`ErrorKind`].
    ///
    /// Auth wins over everything since retrying it only burns budget, then
    /// rate limits, then content blocks. Anything unmatched is transient.
    pub fn classify(&self, status: Option<u16>, body: &str) -> ErrorKind {
        let body = body.to_lowercase();
        let mentions = |markers: &[String]| {
            markers
                .iter()
                .filter(|marker| !marker.is_empty())
                .any(|marker| body.contains(&marker.to_lowercase()))
        };

        if matches!(status, Some(401 | 403)) || mentions(&self.auth_markers) {
            ErrorKind::Auth
        } else if status == Some(429) || mentions(&self.rate_limit_markers) {
            ErrorKind::RateLimited
        } else if mentions(&self.content_block_markers) {
            ErrorKind::ContentBlocked
        } else {
            ErrorKind::Transient
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(status: Option<u16>, body: &str) -> ErrorKind {
        ErrorVocabulary::default().classify(status, body)
    }

    #[test]
    fn status_codes_take_priority() {
        assert_eq!(classify(Some(401), "whatever"), ErrorKind::Auth);
        assert_eq!(classify(Some(403), ""), ErrorKind::Auth);
        assert_eq!(classify(Some(429), ""), ErrorKind::RateLimited);
        assert_eq!(classify(Some(500), "Internal Server Error"), ErrorKind::Transient);
    }

    #[test]
    fn recorded_rate_limit_messages() {
        for body in [
            "Rate limit exceeded, please try again later",
            r#"{"error":{"code":8,"status":"RESOURCE_EXHAUSTED"}}"#,
            "Too Many Requests",
            "Limite de taxa atingido. Aguarde alguns minutos.",
            "Erro: muitas requisições simultâneas",
        ] {
            assert_eq!(classify(Some(500), body), ErrorKind::RateLimited, "{body}");
        }
    }

    #[test]
    fn recorded_content_block_messages() {
        for body in [
            "Image generation blocked by safety filters",
            "Your prompt violates our content policy",
            "FILTERED_CONTENT: prompt rejected",
            "Conteúdo bloqueado pela política de segurança",
            "Prompt inapropriado detectado",
        ] {
            assert_eq!(classify(Some(400), body), ErrorKind::ContentBlocked, "{body}");
        }
    }

    #[test]
    fn recorded_auth_messages() {
        for body in [
            "Cookie expired, please log in again",
            "UNAUTHENTICATED: request had invalid authentication credentials",
            "Sessão expirada",
            "Erro de autenticação no provedor",
        ] {
            assert_eq!(classify(Some(500), body), ErrorKind::Auth, "{body}");
        }
    }

    #[test]
    fn auth_beats_rate_limit_and_rate_limit_beats_block() {
        assert_eq!(
            classify(None, "session expired after rate limit"),
            ErrorKind::Auth
        );
        assert_eq!(
            classify(None, "rate limit: request blocked"),
            ErrorKind::RateLimited
        );
    }

    #[test]
    fn unmatched_errors_are_transient() {
        assert_eq!(classify(None, "connection reset by peer"), ErrorKind::Transient);
        assert_eq!(classify(None, ""), ErrorKind::Transient);
        assert_eq!(classify(Some(502), "Bad Gateway"), ErrorKind::Transient);
    }

    #[test]
    fn custom_vocabulary_replaces_markers() {
        let vocabulary = ErrorVocabulary {
            auth_markers: vec!["KEY REVOKED".to_string()],
            rate_limit_markers: vec![],
            content_block_markers: vec!["nope".to_string(), String::new()],
        };
        assert_eq!(vocabulary.classify(None, "key revoked"), ErrorKind::Auth);
        assert_eq!(vocabulary.classify(None, "Nope."), ErrorKind::ContentBlocked);
        assert_eq!(vocabulary.classify(None, "rate limit"), ErrorKind::Transient);
    }
}
