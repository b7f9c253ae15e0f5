use std::io::Write;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Result, bail};
use clap::Parser;
use log::info;

use glowinfer::logging;
use glowinfer::model::Transformer;
use glowinfer::sampler::{SamplingParams, TokenRng};
use glowinfer::tokenizer::Tokenizer;

#[derive(Parser)]
#[command(name = "glowinfer", about = "Llama-2 inference on portable GPU compute shaders")]
struct Args {
    /// Model checkpoint file
    checkpoint: PathBuf,

    /// Temperature; 0 = greedy argmax
    #[arg(short = 't', default_value_t = 1.0)]
    temperature: f32,

    /// Top-p (nucleus) cutoff; 0 = off
    #[arg(short = 'p', default_value_t = 0.9)]
    topp: f32,

    /// Random seed; defaults to the current Unix time
    #[arg(short = 's')]
    seed: Option<u64>,

    /// Number of steps to run for; 0 = max_seq_len
    #[arg(short = 'n', default_value_t = 256)]
    steps: i32,

    /// Input prompt
    #[arg(short = 'i')]
    prompt: Option<String>,
}

fn main() -> Result<()> {
    logging::init_default();
    let args = Args::parse();

    let seed = args.seed.unwrap_or_else(|| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before Unix epoch")
            .as_secs()
    });
    if seed == 0 {
        bail!("cannot use seed=0 with the xorshift rng");
    }
    let mut rng = TokenRng::new(seed);
    let params = SamplingParams {
        temperature: args.temperature,
        topp: args.topp,
    };

    let mut model = Transformer::load(&args.checkpoint)?;
    let steps = model.config.clamp_steps(args.steps);

    let tokenizer = Tokenizer::from_file("tokenizer.bin".as_ref(), model.config.vocab_size)?;

    let prompt_tokens = match args.prompt.as_deref() {
        Some(prompt) => tokenizer.encode(prompt)?,
        None => Vec::new(),
    };
    info!(
        "generating: steps={steps} prompt_tokens={} temperature={} topp={} seed={seed}",
        prompt_tokens.len(),
        params.temperature,
        params.topp
    );

    let mut stdout = std::io::stdout().lock();
    let stats = model.generate(
        &tokenizer,
        &prompt_tokens,
        steps,
        &params,
        &mut rng,
        &mut stdout,
    )?;
    stdout.write_all(b"\n")?;
    stdout.flush()?;

    // the timer starts after the first iteration, so fewer than two steps
    // have nothing to report
    if let Some(tok_per_sec) = stats.tok_per_sec {
        eprintln!("achieved tok/s: {tok_per_sec}");
    }
    Ok(())
}
