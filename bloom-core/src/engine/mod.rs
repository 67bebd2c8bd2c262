//! engine — on-device image classification
//!
//! [`Classifier`] is the seam the analyzer talks to. [`OnnxClassifier`] is the
//! production implementation: an ONNX Runtime session plus a label file.
//!
//! The execution configuration is chosen once, up front, as an
//! [`Acceleration`]: either a hardware execution provider or a CPU session
//! with a fixed intra-op thread count.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, ensure};
use fast_image_resize as fr;
use ort::execution_providers::{self as ep, ExecutionProvider};
use ort::session::Session;
use ort::value::Tensor;
use tracing::{debug, info, warn};

use crate::convert::rgb_len;
use crate::recognition::Category;
use crate::video::RgbFrame;

/// Default model input side length (MobileNet-style classifiers).
pub const DEFAULT_INPUT_SIZE: u32 = 224;
/// CPU thread count when no accelerator is used.
pub const DEFAULT_FALLBACK_THREADS: usize = 4;

// ── Classifier seam ──────────────────────────────────────────────────────────

/// Anything that turns an RGB frame into scored labels.
pub trait Classifier: Send {
    fn classify(&mut self, frame: &RgbFrame) -> Result<Vec<Category>>;
}

impl<C: Classifier + ?Sized> Classifier for Box<C> {
    fn classify(&mut self, frame: &RgbFrame) -> Result<Vec<Category>> {
        (**self).classify(frame)
    }
}

// ── Acceleration ─────────────────────────────────────────────────────────────

/// What the user asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccelerationPreference {
    /// Probe the hardware and use an accelerator when one is available.
    #[default]
    Auto,
    Accelerated,
    Cpu,
}

/// The resolved execution configuration, fixed for the session's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acceleration {
    Accelerated,
    Fallback { threads: usize },
}

impl Acceleration {
    pub fn resolve(preference: AccelerationPreference, threads: usize) -> Self {
        let fallback = Self::Fallback {
            threads: threads.max(1),
        };
        match preference {
            AccelerationPreference::Cpu => fallback,
            AccelerationPreference::Accelerated => Self::Accelerated,
            AccelerationPreference::Auto => {
                if accelerator_available() {
                    info!("hardware accelerator available");
                    Self::Accelerated
                } else {
                    info!(threads = threads.max(1), "no accelerator, using CPU");
                    fallback
                }
            }
        }
    }
}

/// Probe errors count as "not available".
fn accelerator_available() -> bool {
    let probe = if cfg!(target_vendor = "apple") {
        ep::CoreMLExecutionProvider::default().is_available()
    } else {
        ep::CUDAExecutionProvider::default().is_available()
    };
    match probe {
        Ok(available) => available,
        Err(e) => {
            warn!("accelerator probe failed: {e}");
            false
        }
    }
}

fn accelerated_provider() -> ep::ExecutionProviderDispatch {
    if cfg!(target_vendor = "apple") {
        ep::CoreMLExecutionProvider::default()
            .with_compute_units(ep::coreml::CoreMLComputeUnits::CPUAndNeuralEngine)
            .build()
    } else {
        ep::CUDAExecutionProvider::default().build()
    }
}

// ── ONNX classifier ──────────────────────────────────────────────────────────

/// Input pixel scaling expected by the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Normalization {
    /// `x / 255` → `[0, 1]`
    #[default]
    UnitRange,
    /// `(x - 127.5) / 127.5` → `[-1, 1]`
    Symmetric,
}

impl Normalization {
    fn apply(self, v: u8) -> f32 {
        match self {
            Self::UnitRange => v as f32 / 255.0,
            Self::Symmetric => (v as f32 - 127.5) / 127.5,
        }
    }
}

/// What the model's output vector contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScoreKind {
    #[default]
    Probabilities,
    /// Raw logits; softmax is applied before ranking.
    Logits,
}

#[derive(Debug, Clone, Copy)]
pub struct ClassifierConfig {
    pub input_size: u32,
    pub normalization: Normalization,
    pub scores: ScoreKind,
    pub acceleration: Acceleration,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            input_size: DEFAULT_INPUT_SIZE,
            normalization: Normalization::default(),
            scores: ScoreKind::default(),
            acceleration: Acceleration::Fallback {
                threads: DEFAULT_FALLBACK_THREADS,
            },
        }
    }
}

/// ONNX Runtime session + labels.
pub struct OnnxClassifier {
    session: Session,
    input_name: String,
    labels: Vec<String>,
    config: ClassifierConfig,
    resizer: fr::Resizer,
    resize_buf: Vec<u8>,
}

impl OnnxClassifier {
    pub fn load<P: AsRef<Path>, Q: AsRef<Path>>(
        model_path: P,
        labels_path: Q,
        config: ClassifierConfig,
    ) -> Result<Self> {
        ensure!(config.input_size > 0, "model input size must be non-zero");
        let buf_len = rgb_len(config.input_size, config.input_size)
            .context("model input size is too large")?;

        let labels_path = labels_path.as_ref();
        let labels = load_labels(labels_path)
            .with_context(|| format!("failed to load labels: {}", labels_path.display()))?;

        let session = build_session(model_path.as_ref(), config.acceleration)?;
        let input_name = session
            .inputs
            .first()
            .context("model declares no inputs")?
            .name
            .clone();

        info!(
            model = %model_path.as_ref().display(),
            labels = labels.len(),
            input = %input_name,
            input_size = config.input_size,
            acceleration = ?config.acceleration,
            "classifier loaded"
        );

        Ok(Self {
            session,
            input_name,
            labels,
            config,
            resizer: fr::Resizer::new(),
            resize_buf: vec![0u8; buf_len],
        })
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    fn preprocess(&mut self, frame: &RgbFrame) -> Result<ort::value::DynValue> {
        let size = self.config.input_size;
        // A failed resize leaves the buffer taken; restore it before reuse.
        self.resize_buf.resize(rgb_len(size, size)?, 0);
        let src =
            fr::images::ImageRef::new(frame.width, frame.height, &frame.data, fr::PixelType::U8x3)
                .context("failed to create fast_image_resize source")?;

        let mut dst = fr::images::Image::from_vec_u8(
            size,
            size,
            std::mem::take(&mut self.resize_buf),
            fr::PixelType::U8x3,
        )
        .context("failed to create fast_image_resize destination")?;

        let options = fr::ResizeOptions::new()
            .resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Bilinear));
        self.resizer
            .resize(&src, &mut dst, Some(&options))
            .context("model input resize failed")?;

        self.resize_buf = dst.into_vec();
        let tensor_data = to_nchw(&self.resize_buf, size, self.config.normalization);

        let shape = [1usize, 3, size as usize, size as usize];
        Ok(Tensor::from_array((shape, tensor_data.into_boxed_slice()))
            .context("failed to create model input tensor")?
            .into_dyn())
    }
}

impl Classifier for OnnxClassifier {
    fn classify(&mut self, frame: &RgbFrame) -> Result<Vec<Category>> {
        let input = self.preprocess(frame)?;

        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => input])
            .context("classifier inference failed")?;

        let first = outputs
            .iter()
            .next()
            .context("classifier produced no outputs")?
            .1;
        let (_shape, data) = first
            .try_extract_tensor::<f32>()
            .context("failed to extract classifier output tensor")?;

        let scores = match self.config.scores {
            ScoreKind::Probabilities => data.to_vec(),
            ScoreKind::Logits => softmax(data),
        };
        debug!(classes = scores.len(), "classifier output");

        categorize(&self.labels, scores)
    }
}

fn build_session(model_path: &Path, acceleration: Acceleration) -> Result<Session> {
    let mut builder = Session::builder().context("failed to create ORT session builder")?;
    builder = match acceleration {
        Acceleration::Accelerated => builder
            .with_execution_providers([accelerated_provider()])
            .context("failed to register execution providers")?,
        Acceleration::Fallback { threads } => builder
            .with_intra_threads(threads)
            .context("failed to set ORT intra threads")?,
    };
    builder = builder
        .with_inter_threads(1)
        .context("failed to set ORT inter threads")?;
    builder
        .commit_from_file(model_path)
        .with_context(|| format!("failed to load ONNX model: {}", model_path.display()))
}

// ── Pre/post-processing helpers ──────────────────────────────────────────────

/// One label per line; surrounding whitespace and blank lines are ignored.
pub fn parse_labels(text: &str) -> Result<Vec<String>> {
    let labels: Vec<String> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_owned)
        .collect();
    ensure!(!labels.is_empty(), "label file contains no labels");
    Ok(labels)
}

fn load_labels(path: &Path) -> Result<Vec<String>> {
    let text = fs::read_to_string(path)?;
    parse_labels(&text)
}

/// Packed RGB24 → planar NCHW floats.
fn to_nchw(raw: &[u8], size: u32, normalization: Normalization) -> Vec<f32> {
    let plane = size as usize * size as usize;
    let mut out = vec![0f32; 3 * plane];
    for idx in 0..plane {
        out[idx] = normalization.apply(raw[idx * 3]);
        out[plane + idx] = normalization.apply(raw[idx * 3 + 1]);
        out[2 * plane + idx] = normalization.apply(raw[idx * 3 + 2]);
    }
    out
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|x| (x - max).exp()).collect();
    let sum = exps.iter().sum::<f32>().max(f32::MIN_POSITIVE);
    exps.into_iter().map(|e| e / sum).collect()
}

/// Pair scores with labels. The model and the label file must agree on the
/// number of classes.
fn categorize(labels: &[String], scores: Vec<f32>) -> Result<Vec<Category>> {
    ensure!(
        scores.len() == labels.len(),
        "model produced {} scores but {} labels are loaded",
        scores.len(),
        labels.len()
    );
    Ok(labels
        .iter()
        .zip(scores)
        .map(|(label, score)| Category::new(label.clone(), score))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_skip_blank_lines() {
        let labels = parse_labels("daisy\n\n  rose \ntulip\n").unwrap();
        assert_eq!(labels, vec!["daisy", "rose", "tulip"]);
        assert!(parse_labels(" \n\n").is_err());
    }

    #[test]
    fn softmax_sums_to_one_and_keeps_order() {
        let p = softmax(&[1.0, 3.0, 2.0]);
        let sum: f32 = p.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
        assert!(p[1] > p[2] && p[2] > p[0]);
    }

    #[test]
    fn softmax_handles_large_logits() {
        let p = softmax(&[1000.0, 1000.0]);
        assert!((p[0] - 0.5).abs() < 1e-5);
    }

    #[test]
    fn categorize_requires_matching_lengths() {
        let labels = vec!["a".to_string(), "b".to_string()];
        let cats = categorize(&labels, vec![0.25, 0.75]).unwrap();
        assert_eq!(cats[1], Category::new("b", 0.75));
        assert!(categorize(&labels, vec![1.0]).is_err());
    }

    #[test]
    fn nchw_layout_and_normalization() {
        // 1x1 image, one pixel (255, 0, 51)
        let raw = [255u8, 0, 51];
        assert_eq!(to_nchw(&raw, 1, Normalization::UnitRange), vec![1.0, 0.0, 0.2]);
        let sym = to_nchw(&raw, 1, Normalization::Symmetric);
        assert!((sym[0] - 1.0).abs() < 1e-6);
        assert!((sym[1] + 1.0).abs() < 1e-6);
    }

    #[test]
    fn cpu_preference_never_probes() {
        assert_eq!(
            Acceleration::resolve(AccelerationPreference::Cpu, 0),
            Acceleration::Fallback { threads: 1 }
        );
        assert_eq!(
            Acceleration::resolve(AccelerationPreference::Accelerated, 4),
            Acceleration::Accelerated
        );
    }
}
