//! Scenes and the characters that appear in them

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ScenegenError;

/// A unit of narrative content that gets one generated image.
#[derive(Clone, Debug, Default, Deserialize, Serialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Scene {
    /// 1-based sequence number, also the cache key
    pub number: u32,
    /// Narration text for this scene
    pub text: String,
    /// Prompt sent to the image endpoint
    pub prompt: String,
    /// Words in `text`
    #[serde(default)]
    pub word_count: usize,
    /// Character appearing in the scene, used for seed lookup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub character_name: Option<String>,
    /// Generated image, once there is one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

impl Scene {
    /// Builds a scene with the word count derived from the text.
    pub fn new(number: u32, text: impl Into<String>, prompt: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            number,
            word_count: count_words(&text),
            text,
            prompt: prompt.into(),
            character_name: None,
            image_url: None,
        }
    }

    /// Sets the character shown in this scene.
    pub fn with_character(mut self, name: impl Into<String>) -> Self {
        self.character_name = Some(name.into());
        self
    }

    /// True when the scene already has an image.
    pub fn has_image(&self) -> bool {
        self.image_url.as_deref().is_some_and(|url| !url.is_empty())
    }
}

/// A recurring character, kept visually stable through a fixed seed.
#[derive(Clone, Debug, Deserialize, Serialize, Eq, PartialEq)]
pub struct CharacterDescriptor {
    /// Name as it appears on scenes
    pub name: String,
    /// Visual description
    #[serde(default)]
    pub description: String,
    /// Image seed shared by every scene with this character
    pub seed: i64,
}

/// Looks up the seed for a character by name, ignoring case and padding.
pub fn seed_for(characters: &[CharacterDescriptor], name: Option<&str>) -> Option<i64> {
    let name = name?.trim();
    if name.is_empty() {
        return None;
    }
    characters
        .iter()
        .find(|character| character.name.trim().to_lowercase() == name.to_lowercase())
        .map(|character| character.seed)
}

fn count_words(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Reads a JSON array of scenes, filling in missing word counts.
pub fn load_scenes(path: &Path) -> Result<Vec<Scene>, ScenegenError> {
    let raw = std::fs::read_to_string(path)?;
    let mut scenes: Vec<Scene> = serde_json::from_str(&raw)?;
    for scene in scenes.iter_mut() {
        if scene.word_count == 0 {
            scene.word_count = count_words(&scene.text);
        }
    }
    Ok(scenes)
}

/// Reads a JSON array of characters.
pub fn load_characters(path: &Path) -> Result<Vec<CharacterDescriptor>, ScenegenError> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}
