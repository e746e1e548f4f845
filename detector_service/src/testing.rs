//! Fixtures shared by the unit tests.
//!
//! The mock model reads its descriptor as `class_id[:delay_ms]` and reports
//! `width - 1` candidates for every image, so fixture images pick their
//! detection count through their width.

use crate::{
    archive::{tests::write_package, USAGE_ORDER_FILE},
    decoder::{FileImageDecoder, ImageDecoder},
    error::ModelError,
    model_service::{Candidate, DetectionModel, ModelService},
};
use image::{DynamicImage, ImageBuffer, ImageFormat, Rgb};
use parking_lot::Mutex;
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

pub(crate) const MOCK_DESCRIPTOR_ID: &str = "MODELFILE";

#[derive(Debug, Default)]
pub(crate) struct MockModelService;

impl ModelService for MockModelService {
    type Model = MockModel;

    const DESCRIPTOR_ID: &'static str = MOCK_DESCRIPTOR_ID;

    fn load(&self, descriptor: &Path) -> Result<MockModel, ModelError> {
        let text =
            std::fs::read_to_string(descriptor).map_err(|e| ModelError::Load(e.to_string()))?;
        let text = text.trim();
        let (id, delay_ms) = match text.split_once(':') {
            Some((id, delay)) => (
                id,
                delay
                    .parse::<u64>()
                    .map_err(|e| ModelError::Load(format!("bad delay: {}", e)))?,
            ),
            None => (text, 0),
        };
        let id = id
            .parse::<u32>()
            .map_err(|e| ModelError::Load(format!("bad model id: {}", e)))?;

        Ok(MockModel {
            id,
            delay: Duration::from_millis(delay_ms),
        })
    }
}

#[derive(Debug)]
pub(crate) struct MockModel {
    pub id: u32,
    pub delay: Duration,
}

impl MockModel {
    pub(crate) fn new(id: u32) -> Self {
        Self {
            id,
            delay: Duration::ZERO,
        }
    }
}

impl DetectionModel for MockModel {
    fn detect(&self, image: &DynamicImage) -> Result<Vec<Candidate>, ModelError> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        Ok((1..image.width())
            .map(|i| Candidate {
                class_id: self.id,
                score: 0.9,
                bbox: [0.0, 0.0, i as f32, 1.0],
            })
            .collect())
    }
}

/// Decodes from disk and remembers every path it was asked for.
#[derive(Default)]
pub(crate) struct CountingDecoder {
    pub seen: Mutex<Vec<PathBuf>>,
}

impl ImageDecoder for CountingDecoder {
    fn decode(&self, path: &Path) -> Option<DynamicImage> {
        self.seen.lock().push(path.to_path_buf());
        FileImageDecoder.decode(path)
    }
}

/// Writes a PNG-encoded image whatever the extension says.
pub(crate) fn write_image(path: &Path, width: u32) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    ImageBuffer::<Rgb<u8>, Vec<u8>>::from_pixel(width, 2, Rgb([0, 0, 0]))
        .save_with_format(path, ImageFormat::Png)?;
    Ok(())
}

pub(crate) fn write_model_package(path: &Path, descriptor: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let manifest = format!("{}:model/descriptor.txt\n", MOCK_DESCRIPTOR_ID);
    write_package(
        path,
        &[
            (USAGE_ORDER_FILE, manifest.as_bytes()),
            ("model/descriptor.txt", descriptor.as_bytes()),
        ],
        true,
    )
}
