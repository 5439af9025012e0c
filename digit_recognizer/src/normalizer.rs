use image::{imageops::FilterType, DynamicImage};
use serde::Deserialize;
use std::io::Cursor;
use thiserror::Error;

pub const IMAGE_SIDE: u32 = 28;
pub const FEATURE_LENGTH: usize = (IMAGE_SIDE * IMAGE_SIDE) as usize;

#[derive(Error, Debug)]
pub enum NormalizeError {
    #[error("Failed to guess image format: {0}")]
    GuessFormat(#[from] std::io::Error),
    #[error("Failed to decode image: {0}")]
    Decode(#[from] image::ImageError),
}

/// Resampling filter applied when shrinking to 28x28. Changing it changes
/// the pixels the model sees, so it is pinned in configuration.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResizeFilter {
    Nearest,
    Triangle,
    #[default]
    CatmullRom,
    Gaussian,
    Lanczos3,
}

impl From<ResizeFilter> for FilterType {
    fn from(filter: ResizeFilter) -> Self {
        match filter {
            ResizeFilter::Nearest => FilterType::Nearest,
            ResizeFilter::Triangle => FilterType::Triangle,
            ResizeFilter::CatmullRom => FilterType::CatmullRom,
            ResizeFilter::Gaussian => FilterType::Gaussian,
            ResizeFilter::Lanczos3 => FilterType::Lanczos3,
        }
    }
}

/// 28x28 grayscale intensities in row-major order. 0 is black.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureVector([u8; FEATURE_LENGTH]);

impl FeatureVector {
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn to_f32(&self) -> Vec<f32> {
        self.0.iter().map(|&v| v as f32).collect()
    }
}

pub fn decode(image_data: &[u8]) -> Result<DynamicImage, NormalizeError> {
    let image_reader = image::ImageReader::new(Cursor::new(image_data)).with_guessed_format()?;
    Ok(image_reader.decode()?)
}

pub fn normalize(image: &DynamicImage, filter: ResizeFilter) -> FeatureVector {
    let grey = image.to_luma8();
    let resized = image::imageops::resize(&grey, IMAGE_SIDE, IMAGE_SIDE, filter.into());

    let mut pixels = [0u8; FEATURE_LENGTH];
    pixels.copy_from_slice(resized.as_raw());
    FeatureVector(pixels)
}
