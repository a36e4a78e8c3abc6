/// Offline segmentation demo
/// Runs a recording through the segmenter and saves each utterance it finds
use anyhow::{bail, Context, Result};
use clap::Parser;
use rhotalk::audio_seg::{CloseReason, SegConfig, Segmenter, Utterance, FRAME_SAMPLES, SAMPLE_RATE};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser, Debug)]
#[command(about = "Split a 16 kHz mono WAV file into utterances")]
struct Args {
    /// Input recording
    input: PathBuf,

    /// Directory for segment_NN.wav files
    #[arg(short, long, default_value = ".")]
    out_dir: PathBuf,

    /// Silence that ends an utterance
    #[arg(long, default_value_t = 800)]
    silence_ms: u64,

    /// Shortest utterance kept
    #[arg(long, default_value_t = 300)]
    min_speech_ms: u64,

    /// Frame RMS below which audio is never speech
    #[arg(long, default_value_t = 2200.0)]
    rms_threshold: f32,

    /// Classifier aggressiveness, 0-3
    #[arg(long, default_value_t = 3)]
    aggressiveness: u8,

    /// Close utterances longer than this
    #[arg(long)]
    max_ms: Option<u64>,
}

fn read_pcm(path: &Path) -> Result<Vec<i16>> {
    let reader = hound::WavReader::open(path).with_context(|| format!("opening {}", path.display()))?;
    let spec = reader.spec();
    if spec.channels != 1 || spec.sample_rate != SAMPLE_RATE || spec.bits_per_sample != 16 {
        bail!(
            "expected 16-bit mono {} Hz audio, got {} channel(s) at {} Hz, {} bits",
            SAMPLE_RATE,
            spec.channels,
            spec.sample_rate,
            spec.bits_per_sample
        );
    }
    reader
        .into_samples::<i16>()
        .collect::<Result<Vec<_>, _>>()
        .context("reading samples")
}

fn save_utterance(utterance: &Utterance, path: &Path) -> Result<()> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec)?;
    for &sample in &utterance.pcm {
        writer.write_sample(sample)?;
    }
    writer.finalize()?;
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();
    let cfg = SegConfig {
        rms_threshold: args.rms_threshold,
        hangover_ms: args.silence_ms,
        min_speech_ms: args.min_speech_ms,
        aggressiveness: args.aggressiveness,
        max_utterance_ms: args.max_ms,
        ..SegConfig::default()
    };
    let segmenter = Segmenter::new(cfg)?;

    let pcm = read_pcm(&args.input)?;
    info!(
        samples = pcm.len(),
        seconds = pcm.len() as f32 / SAMPLE_RATE as f32,
        "loaded recording"
    );

    let mut utterances = Vec::new();
    for frame in pcm.chunks_exact(FRAME_SAMPLES) {
        if let Some(u) = segmenter.process(frame) {
            utterances.push(u);
        }
    }
    if let Some(u) = segmenter.force_commit() {
        utterances.push(u);
    }

    std::fs::create_dir_all(&args.out_dir)?;
    for (i, utterance) in utterances.iter().enumerate() {
        let reason = match utterance.close_reason {
            CloseReason::Silence => "silence",
            CloseReason::MaxLength => "max length",
            CloseReason::Forced => "end of input",
        };
        let path = args.out_dir.join(format!("segment_{:02}.wav", i + 1));
        save_utterance(utterance, &path)?;
        println!(
            "#{:02} {:>6} ms  {:>3} speech frames  closed by {:<12} -> {}",
            i + 1,
            utterance.duration_ms(),
            utterance.speech_frames,
            reason,
            path.display()
        );
    }

    if utterances.is_empty() {
        println!("No speech found");
    }
    Ok(())
}
