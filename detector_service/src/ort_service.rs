use crate::{
    config::ModelConfig,
    error::ModelError,
    model_service::{Candidate, DetectionModel, ModelService},
};
use image::{imageops::FilterType, DynamicImage, GenericImageView};
use ndarray::{s, Array, ArrayD, Axis, Ix4};
use ort::{
    session::{builder::GraphOptimizationLevel, Session},
    value::TensorRef,
};
use parking_lot::Mutex;
use std::path::Path;

const OUTPUT_NAME: &str = "output0";

fn intersection(box1: &[f32; 4], box2: &[f32; 4]) -> f32 {
    let width = box1[2].min(box2[2]) - box1[0].max(box2[0]);
    let height = box1[3].min(box2[3]) - box1[1].max(box2[1]);
    width.max(0.) * height.max(0.)
}

fn union(box1: &[f32; 4], box2: &[f32; 4]) -> f32 {
    ((box1[2] - box1[0]) * (box1[3] - box1[1])) + ((box2[2] - box2[0]) * (box2[3] - box2[1]))
        - intersection(box1, box2)
}

fn transform_image(image: &DynamicImage, input_size: u32) -> Array<f32, Ix4> {
    let img = image.resize_exact(input_size, input_size, FilterType::CatmullRom);
    let size = input_size as usize;

    let mut input = Array::zeros((1, 3, size, size));
    for pixel in img.pixels() {
        let x = pixel.0 as _;
        let y = pixel.1 as _;
        let [r, g, b, _] = pixel.2 .0;
        input[[0, 0, y, x]] = (r as f32) / 255.;
        input[[0, 1, y, x]] = (g as f32) / 255.;
        input[[0, 2, y, x]] = (b as f32) / 255.;
    }

    input
}

/// One YOLO output row: centre, size, then one score per class. Coordinates
/// are scaled from the network input back to the original image.
fn decode_row(row: &[f32], scale: (f32, f32), min_probability: f32) -> Option<Candidate> {
    if row.len() < 5 {
        return None;
    }
    let (class_id, prob) = row
        .iter()
        .skip(4)
        .copied()
        .enumerate()
        .reduce(|accum, entry| if entry.1 > accum.1 { entry } else { accum })?;

    if prob < min_probability {
        return None;
    }

    let xc = row[0] * scale.0;
    let yc = row[1] * scale.1;
    let w = row[2] * scale.0;
    let h = row[3] * scale.1;

    Some(Candidate {
        class_id: class_id as u32,
        score: prob,
        bbox: [xc - w / 2., yc - h / 2., xc + w / 2., yc + h / 2.],
    })
}

fn non_max_suppression(mut boxes: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
    boxes.sort_by(|box1, box2| box2.score.total_cmp(&box1.score));
    let mut result = Vec::new();

    while !boxes.is_empty() {
        let best = boxes.remove(0);
        result.push(best);
        boxes.retain(|other| {
            intersection(&best.bbox, &other.bbox) / union(&best.bbox, &other.bbox) < iou_threshold
        });
    }

    result
}

#[derive(Debug, Clone)]
pub struct OrtModelService {
    config: ModelConfig,
}

impl OrtModelService {
    pub fn new(config: &ModelConfig) -> Result<Self, ModelError> {
        ort::init()
            .commit()
            .map_err(|e| ModelError::Load(format!("onnx runtime: {}", e)))?;

        Ok(Self {
            config: config.clone(),
        })
    }
}

impl ModelService for OrtModelService {
    type Model = OrtModel;

    const DESCRIPTOR_ID: &'static str = "ONNXFILE";

    fn load(&self, descriptor: &Path) -> Result<OrtModel, ModelError> {
        let session = Session::builder()
            .and_then(|builder| builder.with_optimization_level(GraphOptimizationLevel::Level3))
            .and_then(|builder| builder.commit_from_file(descriptor))
            .map_err(|e| ModelError::Load(e.to_string()))?;

        tracing::info!("Created ONNX session from {:?}", descriptor);

        Ok(OrtModel {
            session: Mutex::new(session),
            min_probability: self.config.min_probability,
            iou_threshold: self.config.iou_threshold,
            input_size: self.config.input_size,
        })
    }
}

pub struct OrtModel {
    session: Mutex<Session>,
    min_probability: f32,
    iou_threshold: f32,
    input_size: u32,
}

impl OrtModel {
    fn run_inference(&self, input: &Array<f32, Ix4>) -> Result<ArrayD<f32>, ModelError> {
        let mut session = self.session.lock();

        let owned_buffer;
        let input_view = if input.view().is_standard_layout() {
            input.view()
        } else {
            owned_buffer = input.to_owned();
            owned_buffer.view()
        };

        let tensor_ref = TensorRef::from_array_view(input_view)
            .map_err(|e| ModelError::Inference(format!("failed to build tensor: {}", e)))?;

        let outputs = session
            .run(ort::inputs![tensor_ref])
            .map_err(|e| ModelError::Inference(e.to_string()))?;

        let (shape, data) = outputs[OUTPUT_NAME]
            .try_extract_tensor::<f32>()
            .map_err(|e| ModelError::Inference(format!("failed to extract tensor: {}", e)))?;

        ArrayD::from_shape_vec(shape.to_ixdyn(), data.to_vec())
            .map_err(|e| ModelError::Inference(format!("invalid tensor shape: {}", e)))
    }
}

impl DetectionModel for OrtModel {
    fn detect(&self, image: &DynamicImage) -> Result<Vec<Candidate>, ModelError> {
        let (img_width, img_height) = image.dimensions();
        let input = transform_image(image, self.input_size);
        let outputs = self.run_inference(&input)?;

        let size = self.input_size as f32;
        let scale = (img_width as f32 / size, img_height as f32 / size);

        let transposed = outputs.t();
        let candidates = transposed
            .slice(s![.., .., 0])
            .axis_iter(Axis(0))
            .filter_map(|row| {
                let row: Vec<f32> = row.iter().copied().collect();
                decode_row(&row, scale, self.min_probability)
            })
            .collect();

        let result = non_max_suppression(candidates, self.iou_threshold);
        tracing::debug!("Returning {} detections", result.len());

        Ok(result)
    }
}
