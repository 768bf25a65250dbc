//! Image classification pipeline: artifact provisioning, model hosting,
//! image normalization and arg-max prediction with sample counts.

pub mod counts;
pub mod error;
pub mod model;
pub mod normalize;
pub mod provision;
#[cfg(feature = "tensorflow")]
pub mod tf;
mod timer;

pub use counts::{LabelCounts, SampleCount};
pub use error::{Error, ErrorKind, Result};
pub use model::{argmax, check_input, Classification, HostConfig, Loaded, Model, ModelHost, ModelLoader};
pub use normalize::{normalize, ChannelOrder, InputTensor, INPUT_SHAPE};
pub use provision::{ensure_present, Artifact, ArtifactSource};
#[cfg(feature = "tensorflow")]
pub use tf::{TfLoader, TfModel};
pub use timer::Timer;
