//! Turns uploaded image bytes into the model's fixed input tensor.

use std::fmt;
use std::str::FromStr;

use image::imageops::{self, FilterType};

use crate::error::{Error, Result};

pub const INPUT_SIDE: u32 = 224;
pub const INPUT_CHANNELS: usize = 3;
/// NHWC shape of a single-image batch.
pub const INPUT_SHAPE: [usize; 4] = [1, INPUT_SIDE as usize, INPUT_SIDE as usize, INPUT_CHANNELS];

/// Channel layout the model was trained with.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum ChannelOrder {
    Rgb,
    /// OpenCV's native layout.
    #[default]
    Bgr,
}

impl FromStr for ChannelOrder {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rgb" => Ok(ChannelOrder::Rgb),
            "bgr" => Ok(ChannelOrder::Bgr),
            other => Err(format!("unknown channel order '{}', expected rgb or bgr", other)),
        }
    }
}

impl fmt::Display for ChannelOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChannelOrder::Rgb => "rgb",
            ChannelOrder::Bgr => "bgr",
        })
    }
}

/// Dense float32 tensor in row-major order.
#[derive(Clone, Debug, PartialEq)]
pub struct InputTensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl InputTensor {
    pub fn new(shape: &[usize], data: Vec<f32>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(Error::InputContract {
                expected: shape.to_vec(),
                actual: vec![data.len()],
            });
        }

        Ok(InputTensor {
            shape: shape.to_vec(),
            data,
        })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }
}

/// Decode `bytes`, stretch to 224x224 and scale every channel to [0, 1].
pub fn normalize(bytes: &[u8], order: ChannelOrder) -> Result<InputTensor> {
    if bytes.is_empty() {
        return Err(Error::Decode("empty upload".to_owned()));
    }

    let image = image::load_from_memory(bytes).map_err(|e| Error::Decode(e.to_string()))?;

    let rgb = image.to_rgb8();
    let resized = imageops::resize(&rgb, INPUT_SIDE, INPUT_SIDE, FilterType::Triangle);

    let mut raw = resized.into_raw();
    if order == ChannelOrder::Bgr {
        for px in raw.chunks_exact_mut(INPUT_CHANNELS) {
            px.swap(0, 2);
        }
    }

    let data = raw.into_iter().map(|x| x as f32 / 255f32).collect();

    InputTensor::new(&INPUT_SHAPE, data)
}
