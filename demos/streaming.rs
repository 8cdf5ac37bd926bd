/*
Streaming ASR transcription over the StreamController core.

cargo run --release --example streaming ./nemotron 6_speakers.wav

Required files under the model directory:
- encoder.onnx (+ encoder.onnx.data)
- decoder_joint.onnx
- tokenizer.model

This feeds the wav file in fixed chunks to simulate a live microphone
stream, calling `tick()` after each chunk and printing the transcript as
it grows. A real microphone integration would call `push_audio` from the
capture callback and `tick` from a timer instead.
*/

use parakeet_stream::{
    ExecutionConfig, ModelDims, OrtEncoder, OrtJoiner, StreamConfig, StreamController, Tokenizer,
};
use std::env;
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;

const PUSH_CHUNK_SAMPLES: usize = 1_600; // 100ms per push_audio call

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let start_time = Instant::now();
    let args: Vec<String> = env::args().collect();

    let model_dir = args.get(1).map(String::as_str).unwrap_or("./nemotron");
    let audio_path = args.get(2).map(String::as_str).unwrap_or("6_speakers.wav");

    let (mut audio, spec) = parakeet_stream::audio::load_audio(audio_path)?;
    if spec.sample_rate != 16_000 {
        return Err(format!("expected 16kHz audio, got {}Hz", spec.sample_rate).into());
    }
    if spec.channels > 1 {
        audio = audio
            .chunks(spec.channels as usize)
            .map(|c| c.iter().sum::<f32>() / spec.channels as f32)
            .collect();
    }
    let duration_sec = audio.len() as f32 / 16_000.0;

    let dims = ModelDims::default();
    let exec_config = ExecutionConfig::default();
    let base = std::path::Path::new(model_dir);
    let encoder = OrtEncoder::from_file(base.join("encoder.onnx"), &exec_config, dims.clone())?;
    let joiner = OrtJoiner::from_file(base.join("decoder_joint.onnx"), &exec_config)?;
    let tokenizer = Arc::new(Tokenizer::from_sentencepiece_model(base.join("tokenizer.model"))?);

    let config = StreamConfig::default();
    let mut controller: StreamController<OrtEncoder, OrtJoiner> = StreamController::new(config);
    controller.set_model(encoder, joiner, tokenizer, dims);

    print!("Streaming: ");
    std::io::stdout().flush()?;
    let mut last_confirmed = String::new();

    for chunk in audio.chunks(PUSH_CHUNK_SAMPLES) {
        controller.push_audio(chunk);
        let _ = controller.tick();

        let snapshot = controller.snapshot();
        if snapshot.confirmed_text != last_confirmed {
            let new_part = snapshot.confirmed_text.trim_start_matches(&last_confirmed[..]);
            print!("{new_part}");
            std::io::stdout().flush()?;
            last_confirmed = snapshot.confirmed_text;
        }
    }

    let transcript = controller.finalize();
    println!("\n\nFinal: {transcript}");

    let elapsed = start_time.elapsed();
    println!(
        "Completed in {:.2}s (audio: {:.2}s, RTF: {:.2}x)",
        elapsed.as_secs_f32(),
        duration_sec,
        elapsed.as_secs_f32() / duration_sec.max(1e-6),
    );

    Ok(())
}
