//! Database entities

pub mod scene_images;
