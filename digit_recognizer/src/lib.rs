mod classifier;
mod normalizer;
mod prediction;
mod routes;
mod server;
mod telemetry;

pub mod app;
pub mod config;

pub use app::start_app;
pub use classifier::{argmax, Classifier, ClassifierError, LabelMap, OrtClassifier};
pub use normalizer::{
    decode, normalize, FeatureVector, NormalizeError, ResizeFilter, FEATURE_LENGTH,
};
pub use prediction::{Prediction, PredictionError, PredictionService};
pub use server::{build_router, SharedState};
pub use telemetry::Metrics;
