use crate::{
    classifier::{argmax, Classifier, ClassifierError, LabelMap},
    config::Config,
    normalizer::{decode, normalize, NormalizeError, ResizeFilter},
    telemetry::{latency_per_unit, Metrics},
};
use axum::body::Bytes;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::instrument;

#[derive(Error, Debug)]
pub enum PredictionError {
    #[error("Image error: {0}")]
    Decode(#[from] NormalizeError),
    #[error("Classifier error: {0}")]
    Classifier(#[from] ClassifierError),
    #[error("Inference timed out after {0:?}")]
    Timeout(Duration),
    #[error("Inference task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("Inference limiter closed")]
    LimiterClosed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub class_id: usize,
    pub label: String,
}

struct Outcome {
    prediction: Prediction,
    elapsed: Duration,
    input_length: usize,
}

pub struct PredictionService {
    classifier: Arc<dyn Classifier>,
    labels: Arc<LabelMap>,
    filter: ResizeFilter,
    metrics: Arc<Metrics>,
    app_name: String,
    limiter: Option<Arc<Semaphore>>,
    timeout: Option<Duration>,
}

impl PredictionService {
    pub fn new(classifier: Arc<dyn Classifier>, metrics: Arc<Metrics>, config: &Config) -> Self {
        Self {
            classifier,
            labels: Arc::new(LabelMap::new(config.model.labels.clone())),
            filter: config.normalizer.filter,
            metrics,
            app_name: config.app_name.clone(),
            limiter: config
                .prediction
                .max_concurrent_inferences
                .filter(|&permits| permits > 0)
                .map(|permits| Arc::new(Semaphore::new(permits))),
            timeout: config.prediction.timeout_ms.map(Duration::from_millis),
        }
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Decodes, normalizes and classifies one uploaded image, then records the
    /// request metrics for `client_id`. Nothing is recorded when any step fails,
    /// so unlike a count-on-arrival counter, `request_count_total` only tracks
    /// answered predictions.
    #[instrument(skip(self, image_data), fields(bytes = image_data.len()))]
    pub async fn handle(
        &self,
        client_id: &str,
        image_data: Bytes,
    ) -> Result<Prediction, PredictionError> {
        // The permit moves into the blocking task so a timed out inference
        // still holds its slot until it actually finishes.
        let permit = match &self.limiter {
            Some(limiter) => Some(
                limiter
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| PredictionError::LimiterClosed)?,
            ),
            None => None,
        };

        let classifier = self.classifier.clone();
        let labels = self.labels.clone();
        let filter = self.filter;

        // Decoding sits outside the timed section.
        let task = tokio::task::spawn_blocking(move || -> Result<Outcome, PredictionError> {
            let _permit = permit;
            let image = decode(&image_data)?;

            let start = Instant::now();
            let features = normalize(&image, filter);
            let scores = classifier.predict(&features)?;
            let class_id = argmax(&scores).ok_or(ClassifierError::NoScores)?;
            let prediction = Prediction {
                class_id,
                label: labels.label_for(class_id),
            };

            Ok(Outcome {
                prediction,
                elapsed: start.elapsed(),
                input_length: features.as_slice().len(),
            })
        });

        // A timed out task keeps running on the blocking pool; only the response is abandoned.
        let outcome = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, task)
                .await
                .map_err(|_| PredictionError::Timeout(limit))???,
            None => task.await??,
        };

        self.record(client_id, outcome.elapsed, outcome.input_length);

        tracing::debug!(
            "Predicted class {} for {} in {:?}",
            outcome.prediction.class_id,
            client_id,
            outcome.elapsed
        );

        Ok(outcome.prediction)
    }

    fn record(&self, client_id: &str, elapsed: Duration, input_length: usize) {
        let duration = elapsed.as_secs_f64();

        self.metrics.increment_request_count(&self.app_name, client_id);
        self.metrics.set_latency(duration);
        self.metrics.set_input_length(client_id, input_length);
        self.metrics
            .set_latency_per_unit(client_id, latency_per_unit(duration, input_length));
    }
}
