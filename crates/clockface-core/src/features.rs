//! Statistical image feature extractor.
//!
//! Summarises a photo as a fixed 64-component vector: intensity histogram,
//! global statistics, gradient statistics, edge-magnitude histogram and
//! per-patch texture variance over a 64×64 intensity grid. Stored templates
//! depend on this exact layout, so the stages and their order are fixed.

use crate::types::FeatureVector;
use image::imageops::{self, FilterType};
use image::{GrayImage, Luma};
use ndarray::{s, Array2, Axis, Zip};
use thiserror::Error;

// --- Named constants (stored templates depend on these) ---
/// Length of every vector produced by [`StatisticalExtractor`].
pub const FEATURE_DIM: usize = 64;
const GRID_SIZE: usize = 64;
const INTENSITY_BINS: usize = 16;
const EDGE_BINS: usize = 8;
const PATCHES_PER_SIDE: usize = 4;
const HISTOGRAM_RANGE: f64 = 256.0;
const HISTOGRAM_EPSILON: f64 = 1e-7;
const MAX_INTENSITY: f64 = 255.0;
const EXTRACTOR_NAME: &str = "statistical-v1";

#[derive(Error, Debug)]
pub enum FeatureError {
    #[error("invalid image: {0}")]
    InvalidImage(String),
    #[error("feature extraction failed: {0}")]
    ExtractionFailed(String),
}

/// Turns encoded image bytes into a fixed-length feature vector.
///
/// Identification and attendance only ever see the resulting vectors, so a
/// stronger extractor can replace [`StatisticalExtractor`] without touching
/// either.
pub trait FeatureExtractor: Send + Sync {
    fn extract(&self, image: &[u8]) -> Result<FeatureVector, FeatureError>;

    /// Identifier of the vector layout; templates from different extractors
    /// are not comparable.
    fn name(&self) -> &str;
}

/// Deterministic extractor built from coarse image statistics.
#[derive(Debug, Default, Clone, Copy)]
pub struct StatisticalExtractor;

impl FeatureExtractor for StatisticalExtractor {
    fn extract(&self, image: &[u8]) -> Result<FeatureVector, FeatureError> {
        let gray = decode_intensity(image)?;
        let grid = resize_to_grid(&gray);
        let values = features_from_grid(&grid);

        if values.iter().any(|v| !v.is_finite()) {
            return Err(FeatureError::ExtractionFailed(
                "non-finite feature component".into(),
            ));
        }

        let vector = FeatureVector::new(values);
        if vector.norm() == 0.0 {
            return Err(FeatureError::ExtractionFailed(
                "image produced an all-zero feature vector".into(),
            ));
        }

        tracing::debug!(
            width = gray.width(),
            height = gray.height(),
            dim = vector.len(),
            "extracted feature vector"
        );
        Ok(vector)
    }

    fn name(&self) -> &str {
        EXTRACTOR_NAME
    }
}

/// Decode image bytes and average the colour channels into one intensity
/// channel. Alpha is discarded.
pub fn decode_intensity(bytes: &[u8]) -> Result<GrayImage, FeatureError> {
    if bytes.is_empty() {
        return Err(FeatureError::InvalidImage("empty image data".into()));
    }

    let img = image::load_from_memory(bytes)
        .map_err(|e| FeatureError::InvalidImage(e.to_string()))?;

    if img.width() == 0 || img.height() == 0 {
        return Err(FeatureError::ExtractionFailed("image has no pixels".into()));
    }

    let rgb = img.to_rgb8();
    Ok(GrayImage::from_fn(rgb.width(), rgb.height(), |x, y| {
        let [r, g, b] = rgb.get_pixel(x, y).0;
        // Truncating mean, matching an 8-bit cast of the float average.
        Luma([((r as u16 + g as u16 + b as u16) / 3) as u8])
    }))
}

/// File extension for the sniffed image format, used to name stored snapshots.
pub fn sniff_extension(bytes: &[u8]) -> &'static str {
    image::guess_format(bytes)
        .ok()
        .and_then(|format| format.extensions_str().first().copied())
        .unwrap_or("bin")
}

fn resize_to_grid(gray: &GrayImage) -> Array2<f64> {
    let resized = imageops::resize(gray, GRID_SIZE as u32, GRID_SIZE as u32, FilterType::Triangle);
    Array2::from_shape_fn((GRID_SIZE, GRID_SIZE), |(y, x)| {
        resized.get_pixel(x as u32, y as u32).0[0] as f64
    })
}

/// Concatenate all feature stages, then truncate or zero-pad to [`FEATURE_DIM`].
fn features_from_grid(grid: &Array2<f64>) -> Vec<f32> {
    let mut features: Vec<f64> = Vec::with_capacity(FEATURE_DIM);

    // (a) intensity histogram
    features.extend(normalized_histogram(grid.iter().copied(), INTENSITY_BINS));

    // (b) global statistics
    let (min, max) = grid
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    features.extend(
        [
            grid.mean().unwrap_or(0.0),
            grid.std(0.0),
            min,
            max,
            median(grid.iter().copied().collect()),
        ]
        .map(|v| v / MAX_INTENSITY),
    );

    // (c) gradient statistics
    let grad_x = gradient(grid, Axis(1));
    let grad_y = gradient(grid, Axis(0));
    features.extend(
        [
            grad_x.mean().unwrap_or(0.0),
            grad_x.std(0.0),
            grad_y.mean().unwrap_or(0.0),
            grad_y.std(0.0),
        ]
        .map(|v| v / MAX_INTENSITY),
    );

    // (d) edge-magnitude histogram
    let edges = Zip::from(&grad_x)
        .and(&grad_y)
        .map_collect(|&gx, &gy| (gx * gx + gy * gy).sqrt());
    features.extend(normalized_histogram(edges.iter().copied(), EDGE_BINS));

    // (e) texture
    features.extend(patch_variances(grid));

    features.truncate(FEATURE_DIM);
    features.resize(FEATURE_DIM, 0.0);
    features.into_iter().map(|v| v as f32).collect()
}

/// Histogram over [0, 256] with `bins` equal-width bins, divided by the
/// counted total (+epsilon). Values outside the range are not counted; the
/// upper edge falls into the last bin.
fn normalized_histogram(values: impl Iterator<Item = f64>, bins: usize) -> Vec<f64> {
    let width = HISTOGRAM_RANGE / bins as f64;
    let mut counts = vec![0u64; bins];
    for v in values {
        if !(0.0..=HISTOGRAM_RANGE).contains(&v) {
            continue;
        }
        let idx = ((v / width) as usize).min(bins - 1);
        counts[idx] += 1;
    }

    let total = counts.iter().sum::<u64>() as f64 + HISTOGRAM_EPSILON;
    counts.iter().map(|&c| c as f64 / total).collect()
}

/// Discrete gradient along `axis`: central differences in the interior,
/// one-sided differences at both borders.
fn gradient(grid: &Array2<f64>, axis: Axis) -> Array2<f64> {
    let n = grid.len_of(axis);
    let mut out = Array2::<f64>::zeros(grid.raw_dim());
    if n < 2 {
        return out;
    }

    Zip::from(out.lanes_mut(axis))
        .and(grid.lanes(axis))
        .for_each(|mut dst, src| {
            dst[0] = src[1] - src[0];
            dst[n - 1] = src[n - 1] - src[n - 2];
            for i in 1..n - 1 {
                dst[i] = (src[i + 1] - src[i - 1]) / 2.0;
            }
        });

    out
}

/// Population variance of each patch in a 4×4 partition, divided by 255².
fn patch_variances(grid: &Array2<f64>) -> Vec<f64> {
    let (rows, cols) = grid.dim();
    let patch_h = rows / PATCHES_PER_SIDE;
    let patch_w = cols / PATCHES_PER_SIDE;
    let scale = MAX_INTENSITY * MAX_INTENSITY;

    let mut out = Vec::with_capacity(PATCHES_PER_SIDE * PATCHES_PER_SIDE);
    for i in 0..PATCHES_PER_SIDE {
        for j in 0..PATCHES_PER_SIDE {
            let patch = grid.slice(s![
                i * patch_h..(i + 1) * patch_h,
                j * patch_w..(j + 1) * patch_w
            ]);
            out.push(if patch.is_empty() { 0.0 } else { patch.var(0.0) / scale });
        }
    }
    out
}

fn median(mut values: Vec<f64>) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}
