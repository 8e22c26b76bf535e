use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};
use vkshift::{GopMode, TranscodeOptions, Transcoder, VideoContextBuilder};

/// Transcode an H.264 MP4 file to H.265 on the GPU via Vulkan Video.
#[derive(Parser)]
#[command(name = "vkshift", version)]
struct Args {
    /// Input MP4/MOV file with one H.264 video track.
    input: PathBuf,
    /// Output MP4 file for the HEVC track.
    output: PathBuf,
    /// Constant QP for the encoder.
    #[arg(long, default_value_t = 28)]
    qp: u32,
    /// Encode trailing P pictures between IDRs instead of all-intra.
    #[arg(long)]
    pframes: bool,
    /// GOP length when --pframes is set.
    #[arg(long, default_value_t = 30)]
    gop_size: u32,
    /// Frame slots in flight (minimum 2).
    #[arg(long, default_value_t = vkshift::DEFAULT_RING_SIZE)]
    ring_size: usize,
    /// Enable Vulkan validation layers.
    #[arg(long)]
    validation: bool,
}

fn run(args: &Args) -> vkshift::Result<u64> {
    let context = VideoContextBuilder::new()
        .app_name("vkshift")
        .enable_validation(args.validation)
        .build()?;

    let options = TranscodeOptions {
        quality_level: args.qp,
        gop_mode: if args.pframes {
            GopMode::LowDelayP {
                gop_size: args.gop_size,
            }
        } else {
            GopMode::IntraOnly
        },
        ring_size: args.ring_size,
    };

    let mut transcoder = Transcoder::new(context, &args.input, &args.output, &options)?;
    transcoder.run()?;
    Ok(transcoder.frames_transcoded())
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer().with_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            ),
        )
        .init();

    let args = Args::parse();
    match run(&args) {
        Ok(frames) => {
            println!("transcoded {frames} frames to {}", args.output.display());
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("error: {}: {err}", err.kind());
            ExitCode::FAILURE
        }
    }
}
