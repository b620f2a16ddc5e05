//! Config handling

use std::path::Path;

use tracing::log::LevelFilter;

use crate::classify::ErrorVocabulary;
use crate::error::ScenegenError;

/// Sets up logging based on the debug flag
pub fn setup_logging(debug: bool) -> Result<(), Box<std::io::Error>> {
    let level = if debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    let mut logger = simple_logger::SimpleLogger::new().with_level(level);
    if !debug {
        logger = logger
            .with_module_level("tracing", LevelFilter::Warn)
            .with_module_level("rustls", LevelFilter::Info)
            .with_module_level("hyper_util", LevelFilter::Info)
            .with_module_level("reqwest", LevelFilter::Info)
            .with_module_level("sqlx", LevelFilter::Warn)
            .with_module_level("sea_orm", LevelFilter::Warn)
            .with_module_level("h2", LevelFilter::Info);
    }
    logger.init().map_err(|err| {
        eprintln!("Failed to initialize logger: {}", err);
        Box::new(std::io::Error::other(err))
    })
}

/// Loads the upstream error vocabulary, falling back to the built-in markers.
pub fn load_error_vocabulary(path: Option<&Path>) -> Result<ErrorVocabulary, ScenegenError> {
    let Some(path) = path else {
        return Ok(ErrorVocabulary::default());
    };
    let raw = std::fs::read_to_string(path)?;
    let vocabulary: ErrorVocabulary = serde_json::from_str(&raw)?;
    if vocabulary.is_empty() {
        return Err(ScenegenError::Config(format!(
            "error vocabulary {} has no markers",
            path.display()
        )));
    }
    Ok(vocabulary)
}
