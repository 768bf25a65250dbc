//! Owns the loaded classifier and its sample-count table for the life of the process.

use std::path::Path;

use log::{debug, info, warn};
use once_cell::sync::OnceCell;
use serde::Serialize;

use crate::counts::{LabelCounts, SampleCount, DEFAULT_COLUMN};
use crate::error::{Error, Result};
use crate::normalize::{normalize, ChannelOrder, InputTensor, INPUT_SHAPE};
use crate::provision::{self, Artifact};
use crate::Timer;

/// A loaded classification network.
pub trait Model: Send + Sync {
    /// Shape of the single tensor the network accepts.
    fn input_shape(&self) -> &[usize] {
        &INPUT_SHAPE
    }

    /// Run a forward pass and return the class scores.
    fn infer(&self, input: &InputTensor) -> Result<Vec<f32>>;
}

/// Deserializes a model artifact.
pub trait ModelLoader: Send + Sync {
    type Model: Model;

    fn load(&self, path: &Path) -> Result<Self::Model>;
}

pub fn check_input(expected: &[usize], input: &InputTensor) -> Result<()> {
    if input.shape() != expected {
        return Err(Error::InputContract {
            expected: expected.to_vec(),
            actual: input.shape().to_vec(),
        });
    }
    Ok(())
}

/// Index and value of the largest score.
///
/// Equal maxima resolve to the lowest index and NaN never beats a number.
pub fn argmax(scores: &[f32]) -> Option<(usize, f32)> {
    let mut best: Option<(usize, f32)> = None;

    for (i, &v) in scores.iter().enumerate() {
        match best {
            Some((_, b)) if !(v > b || (b.is_nan() && !v.is_nan())) => {}
            _ => best = Some((i, v)),
        }
    }

    best
}

#[derive(Clone, Debug)]
pub struct HostConfig {
    pub model: Artifact,
    /// Optional CSV used to report per-class sample counts.
    pub counts: Option<Artifact>,
    pub counts_column: String,
    pub channel_order: ChannelOrder,
}

impl HostConfig {
    pub fn new(model: Artifact) -> Self {
        HostConfig {
            model,
            counts: None,
            counts_column: DEFAULT_COLUMN.to_owned(),
            channel_order: ChannelOrder::default(),
        }
    }
}

/// Everything produced by a successful load.
pub struct Loaded<M> {
    pub model: M,
    pub counts: Option<LabelCounts>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Classification {
    /// Arg-max class index
    pub predicted_class: usize,

    /// Score of the predicted class
    pub probability: f32,

    /// Training samples seen for the predicted class
    pub sample_count: SampleCount,

    /// Time spent decoding and resizing the upload
    pub time_image_load: i64,

    /// Time spent on the forward pass
    pub time_session_run: i64,
}

pub struct ModelHost<L: ModelLoader> {
    loader: L,
    config: HostConfig,
    loaded: OnceCell<Loaded<L::Model>>,
}

impl<L: ModelLoader> ModelHost<L> {
    pub fn new(loader: L, config: HostConfig) -> Self {
        ModelHost {
            loader,
            config,
            loaded: OnceCell::new(),
        }
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn loader(&self) -> &L {
        &self.loader
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.get().is_some()
    }

    /// Load the model and counts table once.
    ///
    /// Concurrent first callers block until a single load finishes and then
    /// all observe the same instance. A failed load is not remembered, so a
    /// later call tries again.
    pub fn ensure_loaded(&self) -> Result<&Loaded<L::Model>> {
        self.loaded.get_or_try_init(|| self.load())
    }

    fn load(&self) -> Result<Loaded<L::Model>> {
        let mut t = Timer::new_start("Loading model");

        let model_path = provision::ensure_present(&self.config.model)?;

        let counts_path = match &self.config.counts {
            Some(counts) if counts.exists() || counts.source.is_some() => {
                Some(provision::ensure_present(counts)?)
            }
            Some(counts) => {
                warn!(
                    "{} not found and no source configured, sample counts unavailable",
                    counts.path.display()
                );
                None
            }
            None => None,
        };

        info!("Loading model from {}", model_path.display());
        let model = self.loader.load(model_path)?;

        let counts = counts_path
            .map(|path| LabelCounts::from_path(path, &self.config.counts_column))
            .transpose()?;

        t.stop();
        info!("Model loaded successfully");

        Ok(Loaded { model, counts })
    }

    /// Forward pass on an already normalized tensor.
    pub fn infer(&self, input: &InputTensor) -> Result<Vec<f32>> {
        let loaded = self.ensure_loaded()?;
        check_input(loaded.model.input_shape(), input)?;
        loaded.model.infer(input)
    }

    /// Classify a normalized tensor and attach the class sample count.
    pub fn predict(&self, input: &InputTensor) -> Result<Classification> {
        let loaded = self.ensure_loaded()?;

        let mut t = Timer::new_start("Running session");
        let scores = self.infer(input)?;
        let time_session_run = t.stop();

        let (class, probability) = argmax(&scores)
            .ok_or_else(|| Error::Inference("model returned no scores".to_owned()))?;
        debug!("class {} scored {}", class, probability);

        Ok(Classification {
            predicted_class: class,
            probability,
            sample_count: SampleCount::lookup(loaded.counts.as_ref(), class),
            time_image_load: 0,
            time_session_run,
        })
    }

    /// Full pipeline for an encoded image.
    pub fn classify(&self, image: &[u8]) -> Result<Classification> {
        self.ensure_loaded()?;

        let mut t = Timer::new_start("Load image from memory");
        let input = normalize(image, self.config.channel_order)?;
        let time_image_load = t.stop();

        let mut classification = self.predict(&input)?;
        classification.time_image_load = time_image_load;

        Ok(classification)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use std::fs;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    /// Scores every class by how close it is to the mean pixel value.
    struct MeanModel {
        classes: usize,
    }

    impl Model for MeanModel {
        fn infer(&self, input: &InputTensor) -> Result<Vec<f32>> {
            check_input(self.input_shape(), input)?;
            let mean = input.data().iter().sum::<f32>() / input.data().len() as f32;
            let hot = ((mean * self.classes as f32) as usize).min(self.classes - 1);
            Ok((0..self.classes)
                .map(|c| if c == hot { 0.9 } else { 0.1 / self.classes as f32 })
                .collect())
        }
    }

    struct CountingLoader {
        classes: usize,
        loads: AtomicUsize,
        delay: Duration,
    }

    impl CountingLoader {
        fn new(classes: usize) -> Self {
            CountingLoader {
                classes,
                loads: AtomicUsize::new(0),
                delay: Duration::from_millis(0),
            }
        }
    }

    impl ModelLoader for CountingLoader {
        type Model = MeanModel;

        fn load(&self, _path: &Path) -> Result<MeanModel> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            Ok(MeanModel {
                classes: self.classes,
            })
        }
    }

    struct BrokenLoader;

    impl ModelLoader for BrokenLoader {
        type Model = MeanModel;

        fn load(&self, path: &Path) -> Result<MeanModel> {
            Err(Error::model_load(path, "not a GraphDef"))
        }
    }

    fn png(px: [u8; 3]) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(RgbImage::from_pixel(300, 200, Rgb(px)))
            .write_to(&mut buf, ImageFormat::Png)
            .unwrap();
        buf.into_inner()
    }

    fn model_dir() -> (tempfile::TempDir, HostConfig) {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("final_model.pb");
        fs::write(&model, b"graph").unwrap();
        (dir, HostConfig::new(Artifact::new(model, None)))
    }

    #[test]
    fn argmax_prefers_first_of_equal_maxima() {
        assert_eq!(argmax(&[0.1, 0.7, 0.7, 0.2]), Some((1, 0.7)));
        assert_eq!(argmax(&[3.0]), Some((0, 3.0)));
        assert_eq!(argmax(&[]), None);
    }

    #[test]
    fn argmax_ignores_nan() {
        assert_eq!(argmax(&[f32::NAN, 0.2, 0.5]), Some((2, 0.5)));
        assert_eq!(argmax(&[0.2, f32::NAN, 0.1]), Some((0, 0.2)));
    }

    #[test]
    fn ensure_loaded_is_idempotent() {
        let (_dir, config) = model_dir();
        let host = ModelHost::new(CountingLoader::new(4), config);

        assert!(!host.is_loaded());
        let first = host.ensure_loaded().unwrap() as *const _;
        for _ in 0..5 {
            assert!(std::ptr::eq(first, host.ensure_loaded().unwrap()));
        }
        assert!(host.is_loaded());
        assert_eq!(host.loader().loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_first_calls_load_once() {
        let (_dir, config) = model_dir();
        let mut loader = CountingLoader::new(4);
        loader.delay = Duration::from_millis(50);
        let host = Arc::new(ModelHost::new(loader, config));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let host = Arc::clone(&host);
                std::thread::spawn(move || host.ensure_loaded().unwrap() as *const _ as usize)
            })
            .collect();

        let addrs: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(addrs.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(host.loader().loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn missing_model_without_source_fails_load() {
        let dir = tempfile::tempdir().unwrap();
        let config = HostConfig::new(Artifact::new(dir.path().join("final_model.pb"), None));
        let host = ModelHost::new(CountingLoader::new(4), config);

        assert!(matches!(host.ensure_loaded(), Err(Error::Config { .. })));
        assert!(!host.is_loaded());
        assert_eq!(host.loader().loads.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn failed_load_is_retried() {
        let (_dir, config) = model_dir();
        let host = ModelHost::new(BrokenLoader, config);

        assert!(matches!(host.ensure_loaded(), Err(Error::ModelLoad { .. })));
        assert!(matches!(host.ensure_loaded(), Err(Error::ModelLoad { .. })));
        assert!(!host.is_loaded());
    }

    #[test]
    fn missing_optional_counts_degrades() {
        let (dir, mut config) = model_dir();
        config.counts = Some(Artifact::new(dir.path().join("train.csv"), None));
        let host = ModelHost::new(CountingLoader::new(4), config);

        let result = host.classify(&png([0, 0, 0])).unwrap();
        assert_eq!(result.predicted_class, 0);
        assert_eq!(result.sample_count, SampleCount::Unavailable);
    }

    #[test]
    fn classify_reports_sample_counts() {
        let (dir, mut config) = model_dir();
        let csv = dir.path().join("train.csv");
        fs::write(&csv, "id,landmark_id\na,3\nb,3\nc,1\n").unwrap();
        config.counts = Some(Artifact::new(csv, None));
        let host = ModelHost::new(CountingLoader::new(4), config);

        let white = host.classify(&png([255, 255, 255])).unwrap();
        assert_eq!(white.predicted_class, 3);
        assert_eq!(white.sample_count, SampleCount::Count(2));

        // mean 0.5 lands in class 2, which has no rows
        let grey = host.classify(&png([128, 128, 128])).unwrap();
        assert_eq!(grey.predicted_class, 2);
        assert_eq!(grey.sample_count, SampleCount::Unknown);
    }

    #[test]
    fn normalized_tensor_satisfies_input_contract() {
        let (_dir, config) = model_dir();
        let host = ModelHost::new(CountingLoader::new(10), config);

        let input = normalize(&png([10, 200, 30]), ChannelOrder::Bgr).unwrap();
        let first = host.infer(&input).unwrap();
        assert_eq!(first.len(), 10);
        assert_eq!(host.infer(&input).unwrap(), first);
    }

    #[test]
    fn wrong_shape_is_rejected() {
        let (_dir, config) = model_dir();
        let host = ModelHost::new(CountingLoader::new(4), config);

        let input = InputTensor::new(&[1, 32, 32, 3], vec![0.5; 32 * 32 * 3]).unwrap();
        assert!(matches!(
            host.infer(&input),
            Err(Error::InputContract { .. })
        ));
    }

    #[test]
    fn undecodable_upload_is_decode_error() {
        let (_dir, config) = model_dir();
        let host = ModelHost::new(CountingLoader::new(4), config);

        assert!(matches!(
            host.classify(b"\x89PNG broken"),
            Err(Error::Decode(_))
        ));
    }
}
