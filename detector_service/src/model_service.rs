use crate::error::ModelError;
use image::DynamicImage;
use std::path::Path;

/// One raw detection: class, score and `[x_min, y_min, x_max, y_max]` box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub class_id: u32,
    pub score: f32,
    pub bbox: [f32; 4],
}

/// Loads descriptors extracted from a model package into a detection model.
pub trait ModelService: Send + Sync + 'static {
    type Model: DetectionModel;

    /// Logical id of the descriptor inside a model package manifest.
    const DESCRIPTOR_ID: &'static str;

    fn load(&self, descriptor: &Path) -> Result<Self::Model, ModelError>;
}

pub trait DetectionModel: Send + Sync + 'static {
    fn detect(&self, image: &DynamicImage) -> Result<Vec<Candidate>, ModelError>;
}
