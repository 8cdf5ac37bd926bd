use crate::error::{Error, Result};
use crate::execution::ModelConfig as ExecutionConfig;
use ndarray::{Array1, Array2, Array3, Array4};
use ort::session::Session;
use std::path::Path;

/// Opaque encoder boundary (spec §6): `[1, n_mels, T] -> [1, D, T_enc]`.
/// Implementations may be internally stateful (e.g. a cache-aware streaming
/// conformer) — the contract only fixes the call shape.
pub trait Encoder {
    fn encode(&mut self, features: &Array3<f32>, length: i64) -> Result<(Array3<f32>, i64)>;
    fn reset(&mut self);
}

/// Opaque joiner boundary (spec §6). Returns raw `[V+K]` logits (token
/// classes followed by TDT duration classes) plus the two new LSTM state
/// tensors; splitting the logits into token/duration halves is
/// [`crate::decoder::DecoderCore`]'s job, not the joiner's.
pub trait Joiner {
    fn step(
        &mut self,
        encoder_frame: &Array3<f32>,
        prev_token: i32,
        state1: &Array3<f32>,
        state2: &Array3<f32>,
    ) -> Result<(Array1<f32>, Array3<f32>, Array3<f32>)>;
}

/// Static tensor-shape configuration for a Parakeet-TDT style model pair.
#[derive(Debug, Clone)]
pub struct ModelDims {
    pub num_encoder_layers: usize,
    pub hidden_dim: usize,
    pub left_context: usize,
    pub conv_context: usize,
    pub decoder_lstm_dim: usize,
    pub decoder_lstm_layers: usize,
    pub vocab_size: usize,
    pub blank_id: usize,
    pub duration_classes: usize,
}

impl Default for ModelDims {
    fn default() -> Self {
        Self {
            num_encoder_layers: 24,
            hidden_dim: 1024,
            left_context: 70,
            conv_context: 8,
            decoder_lstm_dim: 640,
            decoder_lstm_layers: 2,
            vocab_size: 1024,
            blank_id: 1024,
            duration_classes: 5,
        }
    }
}

/// Conformer streaming-encoder cache state: lookback channel cache, conv
/// time cache, and the valid-length counter NeMo's cache-aware encoder
/// needs across chunk boundaries.
#[derive(Clone)]
pub struct EncoderCache {
    pub cache_last_channel: Array4<f32>,
    pub cache_last_time: Array4<f32>,
    pub cache_last_channel_len: Array1<i64>,
}

impl EncoderCache {
    pub fn with_dims(num_layers: usize, left_context: usize, hidden_dim: usize, conv_context: usize) -> Self {
        Self {
            cache_last_channel: Array4::zeros((num_layers, 1, left_context, hidden_dim)),
            cache_last_time: Array4::zeros((num_layers, 1, hidden_dim, conv_context)),
            cache_last_channel_len: Array1::from_vec(vec![0i64]),
        }
    }
}

/// `ort`-backed encoder: wraps the cache-aware streaming conformer ONNX
/// export. The cache tensors are an internal implementation detail hidden
/// behind the plain [`Encoder`] trait.
pub struct OrtEncoder {
    session: Session,
    cache: EncoderCache,
    dims: ModelDims,
}

impl OrtEncoder {
    pub fn from_file<P: AsRef<Path>>(
        path: P,
        exec_config: &ExecutionConfig,
        dims: ModelDims,
    ) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::Config(format!("missing encoder file {}", path.display())));
        }
        let builder = Session::builder()?;
        let builder = exec_config.apply_to_session_builder(builder)?;
        let session = builder.commit_from_file(path)?;
        let cache =
            EncoderCache::with_dims(dims.num_encoder_layers, dims.left_context, dims.hidden_dim, dims.conv_context);
        Ok(Self { session, cache, dims })
    }

    pub fn from_memory(bytes: &[u8], exec_config: &ExecutionConfig, dims: ModelDims) -> Result<Self> {
        let builder = Session::builder()?;
        let builder = exec_config.apply_to_session_builder(builder)?;
        let session = builder.commit_from_memory(bytes)?;
        let cache =
            EncoderCache::with_dims(dims.num_encoder_layers, dims.left_context, dims.hidden_dim, dims.conv_context);
        Ok(Self { session, cache, dims })
    }
}

impl Encoder for OrtEncoder {
    fn encode(&mut self, features: &Array3<f32>, length: i64) -> Result<(Array3<f32>, i64)> {
        let length_arr = Array1::from_vec(vec![length]);

        let outputs = self.session.run(ort::inputs![
            "processed_signal" => ort::value::Value::from_array(features.clone())?,
            "processed_signal_length" => ort::value::Value::from_array(length_arr)?,
            "cache_last_channel" => ort::value::Value::from_array(self.cache.cache_last_channel.clone())?,
            "cache_last_time" => ort::value::Value::from_array(self.cache.cache_last_time.clone())?,
            "cache_last_channel_len" => ort::value::Value::from_array(self.cache.cache_last_channel_len.clone())?
        ])?;

        let (shape, data) = outputs["encoded"]
            .try_extract_tensor::<f32>()
            .map_err(|e| Error::Model(format!("failed to extract encoder output: {e}")))?;
        let dims = shape.as_ref();
        let encoded = Array3::from_shape_vec(
            (dims[0] as usize, dims[1] as usize, dims[2] as usize),
            data.to_vec(),
        )
        .map_err(|e| Error::Model(format!("failed to reshape encoder output: {e}")))?;

        let (_, enc_len_data) = outputs["encoded_len"]
            .try_extract_tensor::<i64>()
            .map_err(|e| Error::Model(format!("failed to extract encoded_len: {e}")))?;
        let encoded_len = enc_len_data[0];

        let (ch_shape, ch_data) = outputs["cache_last_channel_next"]
            .try_extract_tensor::<f32>()
            .map_err(|e| Error::Model(format!("failed to extract cache_last_channel: {e}")))?;
        let (tm_shape, tm_data) = outputs["cache_last_time_next"]
            .try_extract_tensor::<f32>()
            .map_err(|e| Error::Model(format!("failed to extract cache_last_time: {e}")))?;
        let (len_shape, len_data) = outputs["cache_last_channel_len_next"]
            .try_extract_tensor::<i64>()
            .map_err(|e| Error::Model(format!("failed to extract cache_len: {e}")))?;

        self.cache = EncoderCache {
            cache_last_channel: Array4::from_shape_vec(
                (
                    ch_shape[0] as usize,
                    ch_shape[1] as usize,
                    ch_shape[2] as usize,
                    ch_shape[3] as usize,
                ),
                ch_data.to_vec(),
            )
            .map_err(|e| Error::Model(format!("failed to reshape cache_last_channel: {e}")))?,
            cache_last_time: Array4::from_shape_vec(
                (
                    tm_shape[0] as usize,
                    tm_shape[1] as usize,
                    tm_shape[2] as usize,
                    tm_shape[3] as usize,
                ),
                tm_data.to_vec(),
            )
            .map_err(|e| Error::Model(format!("failed to reshape cache_last_time: {e}")))?,
            cache_last_channel_len: Array1::from_shape_vec(len_shape[0] as usize, len_data.to_vec())
                .map_err(|e| Error::Model(format!("failed to reshape cache_len: {e}")))?,
        };

        Ok((encoded, encoded_len))
    }

    fn reset(&mut self) {
        self.cache = EncoderCache::with_dims(
            self.dims.num_encoder_layers,
            self.dims.left_context,
            self.dims.hidden_dim,
            self.dims.conv_context,
        );
    }
}

/// `ort`-backed joiner: prediction network + joint network fused into a
/// single ONNX graph, as exported for Parakeet-TDT.
pub struct OrtJoiner {
    session: Session,
}

impl OrtJoiner {
    pub fn from_file<P: AsRef<Path>>(path: P, exec_config: &ExecutionConfig) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::Config(format!("missing decoder_joint file {}", path.display())));
        }
        let builder = Session::builder()?;
        let builder = exec_config.apply_to_session_builder(builder)?;
        let session = builder.commit_from_file(path)?;
        Ok(Self { session })
    }

    pub fn from_memory(bytes: &[u8], exec_config: &ExecutionConfig) -> Result<Self> {
        let builder = Session::builder()?;
        let builder = exec_config.apply_to_session_builder(builder)?;
        let session = builder.commit_from_memory(bytes)?;
        Ok(Self { session })
    }
}

impl Joiner for OrtJoiner {
    fn step(
        &mut self,
        encoder_frame: &Array3<f32>,
        prev_token: i32,
        state1: &Array3<f32>,
        state2: &Array3<f32>,
    ) -> Result<(Array1<f32>, Array3<f32>, Array3<f32>)> {
        let targets = Array2::from_shape_vec((1, 1), vec![prev_token])
            .map_err(|e| Error::Model(format!("failed to create targets: {e}")))?;
        let target_len = Array1::from_vec(vec![1i32]);

        let outputs = self.session.run(ort::inputs![
            "encoder_outputs" => ort::value::Value::from_array(encoder_frame.clone())?,
            "targets" => ort::value::Value::from_array(targets)?,
            "target_length" => ort::value::Value::from_array(target_len)?,
            "input_states_1" => ort::value::Value::from_array(state1.clone())?,
            "input_states_2" => ort::value::Value::from_array(state2.clone())?
        ])?;

        let (_l_shape, l_data) = outputs["outputs"]
            .try_extract_tensor::<f32>()
            .map_err(|e| Error::Model(format!("failed to extract logits: {e}")))?;
        let logits = Array1::from_vec(l_data.to_vec());

        let (h_shape, h_data) = outputs["output_states_1"]
            .try_extract_tensor::<f32>()
            .map_err(|e| Error::Model(format!("failed to extract state_1: {e}")))?;
        let (c_shape, c_data) = outputs["output_states_2"]
            .try_extract_tensor::<f32>()
            .map_err(|e| Error::Model(format!("failed to extract state_2: {e}")))?;

        let new_state_1 = Array3::from_shape_vec(
            (h_shape[0] as usize, h_shape[1] as usize, h_shape[2] as usize),
            h_data.to_vec(),
        )
        .map_err(|e| Error::Model(format!("failed to reshape state_1: {e}")))?;
        let new_state_2 = Array3::from_shape_vec(
            (c_shape[0] as usize, c_shape[1] as usize, c_shape[2] as usize),
            c_data.to_vec(),
        )
        .map_err(|e| Error::Model(format!("failed to reshape state_2: {e}")))?;

        Ok((logits, new_state_1, new_state_2))
    }
}
