use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use libwv_audio::{Encoder, EncodeStats, InterleavedSource, HEADER_SIZE, MAGIC, SAMPLE_RATES};
use log::debug;
use serde::Serialize;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

mod audio;

#[derive(Parser)]
#[command(name = "rewv")]
#[command(version)]
#[command(about = "Lossless block audio encoder", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Encode an audio file (wav, flac)
    Encode {
        /// Input audio file
        input: PathBuf,
        /// Output file
        output: PathBuf,
        /// Frames per block
        #[arg(short, long, default_value = "22050")]
        block_size: u32,
        /// Decorrelation passes (0, 1, 2, 5, 10 or 16)
        #[arg(short, long, default_value = "5")]
        passes: u32,
        /// Encode stereo pairs as mid/side
        #[arg(short, long)]
        joint: bool,
        /// Keep identical stereo channels as two coded channels
        #[arg(long)]
        no_false_stereo: bool,
        /// Skip the wasted-bit scan
        #[arg(long)]
        no_wasted_bits: bool,
        /// Print encoding statistics as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show information about an encoded file
    Info {
        /// Input encoded file
        input: PathBuf,
    },
}

fn main() -> Result<()> {
    pretty_env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Encode {
            input,
            output,
            block_size,
            passes,
            joint,
            no_false_stereo,
            no_wasted_bits,
            json,
        } => encode(EncodeArgs {
            input,
            output,
            block_size,
            passes,
            joint,
            false_stereo: !no_false_stereo,
            wasted_bits: !no_wasted_bits,
            json,
        }),
        Commands::Info { input } => info(&input),
    }
}

struct EncodeArgs {
    input: PathBuf,
    output: PathBuf,
    block_size: u32,
    passes: u32,
    joint: bool,
    false_stereo: bool,
    wasted_bits: bool,
    json: bool,
}

#[derive(Serialize)]
struct StatsReport {
    frames: u64,
    blocks: u32,
    pcm_bytes: u64,
    stream_bytes: u64,
    compression_ratio: f64,
    md5: String,
}

impl StatsReport {
    fn new(stats: &EncodeStats) -> StatsReport {
        StatsReport {
            frames: stats.frames,
            blocks: stats.blocks,
            pcm_bytes: stats.pcm_bytes,
            stream_bytes: stats.stream_bytes,
            compression_ratio: stats.pcm_bytes as f64 / stats.stream_bytes.max(1) as f64,
            md5: hex_digest(&stats.md5),
        }
    }
}

fn hex_digest(digest: &[u8; 16]) -> String {
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

fn encode(args: EncodeArgs) -> Result<()> {
    if !args.json {
        println!("Reading {}...", args.input.display());
    }

    let pcm = audio::read_audio_file(&args.input).context("Failed to read audio file")?;
    debug!(
        "decoded {} frame(s), {} channel(s) at {} bits",
        pcm.frames(),
        pcm.channels,
        pcm.bits_per_sample
    );

    if !args.json {
        println!("  Sample rate: {} Hz", pcm.sample_rate);
        println!("  Channels:    {}", pcm.channels);
        println!("  Bit depth:   {}", pcm.bits_per_sample);
        println!("  Duration:    {:.2}s", pcm.duration_secs());
        println!("Encoding...");
    }

    let encoder = Encoder::new(pcm.sample_rate, pcm.channels, pcm.bits_per_sample)
        .map_err(anyhow::Error::msg)?
        .block_size(args.block_size)
        .map_err(anyhow::Error::msg)?
        .decorrelation_passes(args.passes)
        .map_err(anyhow::Error::msg)?
        .joint_stereo(args.joint)
        .false_stereo(args.false_stereo)
        .wasted_bits(args.wasted_bits);

    let mut sink = BufWriter::new(
        fs::File::create(&args.output).context("Failed to create output file")?,
    );
    let mut source =
        InterleavedSource::new(&pcm.samples, pcm.channels).map_err(anyhow::Error::msg)?;
    let stats = encoder
        .encode_to(&mut sink, &mut source)
        .map_err(anyhow::Error::msg)?;
    sink.flush().context("Failed to flush output file")?;

    let report = StatsReport::new(&stats);
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Done!");
        println!("  Output: {}", args.output.display());
        println!(
            "  Size:   {} bytes ({:.1}x compression)",
            report.stream_bytes, report.compression_ratio
        );
        println!("  MD5:    {}", report.md5);
    }

    Ok(())
}

// header flag word layout, bit offsets past block_samples
const FLAG_MONO: u32 = 1 << 2;
const FLAG_JOINT: u32 = 1 << 4;
const FLAG_FINAL: u32 = 1 << 12;

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap())
}

fn info(input: &Path) -> Result<()> {
    let data = fs::read(input).context("Failed to read file")?;
    if data.len() < HEADER_SIZE as usize || read_u32(&data, 0) != MAGIC {
        bail!("{} is not an encoded stream", input.display());
    }

    let version = u16::from_le_bytes(data[8..10].try_into().unwrap());
    let total_samples = read_u32(&data, 12);
    let flags = read_u32(&data, 24);

    let bits_per_sample = ((flags & 0x3) + 1) * 8;
    let sample_rate = SAMPLE_RATES.get(((flags >> 23) & 0xF) as usize).copied();

    // the first frame's blocks reveal the channel layout
    let mut channels = 0u32;
    let mut first_frame_open = true;
    let mut offset = 0usize;
    let mut blocks = 0usize;
    while offset + HEADER_SIZE as usize <= data.len() && read_u32(&data, offset) == MAGIC {
        let block_samples = read_u32(&data, offset + 20);
        let block_flags = read_u32(&data, offset + 24);
        if first_frame_open && block_samples > 0 {
            channels += if block_flags & FLAG_MONO != 0 { 1 } else { 2 };
            if block_flags & FLAG_FINAL != 0 {
                first_frame_open = false;
            }
        }
        blocks += 1;
        offset += read_u32(&data, offset + 4) as usize + 8;
    }

    println!("Encoded Audio Stream");
    println!("───────────────────────────────");
    println!("  Version:     0x{:x}", version);
    match sample_rate {
        Some(rate) => println!("  Sample rate: {} Hz", rate),
        None => println!("  Sample rate: non-standard"),
    }
    if channels > 0 {
        println!("  Channels:    {}", channels);
    }
    println!("  Bit depth:   {}", bits_per_sample);
    println!("  Frames:      {}", total_samples);
    if let Some(rate) = sample_rate {
        println!(
            "  Duration:    {:.2}s",
            total_samples as f64 / rate as f64
        );
    }
    println!("  Joint:       {}", if flags & FLAG_JOINT != 0 { "yes" } else { "no" });
    println!("  Blocks:      {}", blocks);
    println!("  File size:   {} bytes", data.len());

    if channels > 0 && total_samples > 0 {
        let pcm_bytes = total_samples as u64 * channels as u64 * (bits_per_sample as u64 / 8);
        println!(
            "  Compression: {:.1}x",
            pcm_bytes as f64 / data.len() as f64
        );
    }

    Ok(())
}
