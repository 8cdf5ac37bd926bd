pub mod audio;
pub mod config;
pub mod controller;
pub mod decoder;
pub mod error;
pub mod execution;
pub mod feature_store;
pub mod mel;
pub mod merger;
pub mod metrics;
pub mod model;
pub mod ring;
pub mod vad;
pub mod vocab;
pub mod window;

pub use config::{
    DecodeOptions, IncrementalOptions, ModelMetadata, PreprocessorConfig, StreamConfig,
};
pub use controller::{Snapshot, StreamController, TickOutcome};
pub use decoder::{DecodeMetrics, DecodeResult, DecoderCore, DecoderState, Token};
pub use error::{Error, Result};
pub use execution::{ExecutionProvider, ModelConfig as ExecutionConfig};
pub use feature_store::{FeatureStore, FeaturesView};
pub use mel::MelEngine;
pub use merger::Merger;
pub use metrics::Metrics;
pub use model::{Encoder, Joiner, ModelDims, OrtEncoder, OrtJoiner};
pub use ring::RingBuffer;
pub use vad::{CombinedVad, EnergyVad, VoiceActivityDetector};
pub use vocab::Tokenizer;
pub use window::{Window, WindowBuilder};
