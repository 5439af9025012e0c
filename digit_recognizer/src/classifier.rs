use crate::{
    config::ModelConfig,
    normalizer::{FeatureVector, FEATURE_LENGTH},
};
use ndarray::Array2;
use ort::{
    session::{builder::GraphOptimizationLevel, Session},
    value::TensorRef,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("Failed to load model: {0}")]
    Load(String),
    #[error("Inference failed: {0}")]
    Inference(String),
    #[error("Model returned no usable scores")]
    NoScores,
}

/// Scores a single feature vector. One score per class, indexed by class id.
pub trait Classifier: Send + Sync + 'static {
    fn predict(&self, features: &FeatureVector) -> Result<Vec<f32>, ClassifierError>;
}

/// Index of the highest score. The first occurrence wins on ties and NaN never
/// wins, where numpy's `argmax` would return the first NaN instead.
pub fn argmax(scores: &[f32]) -> Option<usize> {
    scores
        .iter()
        .copied()
        .enumerate()
        .filter(|(_, score)| !score.is_nan())
        .reduce(|accum, item| if item.1 > accum.1 { item } else { accum })
        .map(|(index, _)| index)
}

#[derive(Debug, Clone, Default)]
pub struct LabelMap {
    labels: Vec<String>,
}

impl LabelMap {
    pub fn new(labels: Vec<String>) -> Self {
        Self { labels }
    }

    pub fn label_for(&self, class_id: usize) -> String {
        self.labels
            .get(class_id)
            .cloned()
            .unwrap_or_else(|| class_id.to_string())
    }
}

/// ONNX Runtime backed classifier. Sessions are handed out round-robin and
/// each one is used by a single request at a time.
pub struct OrtClassifier {
    sessions: Vec<Mutex<Session>>,
    counter: AtomicUsize,
}

impl OrtClassifier {
    pub fn load(model_config: &ModelConfig) -> Result<Self, ClassifierError> {
        model_config.validate().map_err(ClassifierError::Load)?;

        let sessions = (0..model_config.num_instances)
            .map(|_| {
                let session = Session::builder()?
                    .with_optimization_level(GraphOptimizationLevel::Level3)?
                    .commit_from_file(&model_config.path)?;
                Ok(Mutex::new(session))
            })
            .collect::<Result<Vec<_>, ort::Error>>()
            .map_err(|e| ClassifierError::Load(e.to_string()))?;

        tracing::info!(
            "Created {} ONNX sessions from {:?}",
            sessions.len(),
            model_config.path
        );

        Ok(Self {
            sessions,
            counter: AtomicUsize::new(0),
        })
    }
}

impl Classifier for OrtClassifier {
    fn predict(&self, features: &FeatureVector) -> Result<Vec<f32>, ClassifierError> {
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % self.sessions.len();
        let mut session = self.sessions[index].lock();
        tracing::debug!("Handling request with session {}", index);

        let input = Array2::from_shape_vec((1, FEATURE_LENGTH), features.to_f32())
            .map_err(|e| ClassifierError::Inference(format!("invalid input shape: {}", e)))?;

        let tensor_ref = TensorRef::from_array_view(input.view())
            .map_err(|e| ClassifierError::Inference(format!("failed to build tensor: {}", e)))?;

        let outputs = session
            .run(ort::inputs![tensor_ref])
            .map_err(|e| ClassifierError::Inference(e.to_string()))?;

        let (_shape, data) = outputs[0].try_extract_tensor::<f32>().map_err(|e| {
            ClassifierError::Inference(format!("failed to extract tensor: {}", e))
        })?;

        if data.is_empty() {
            return Err(ClassifierError::NoScores);
        }

        Ok(data.to_vec())
    }
}
