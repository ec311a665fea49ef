use anyhow::{bail, Context, Result};
use candle_core::DType;
use candle_transformers::generation::LogitsProcessor;
use clap::{Args, Parser, Subcommand};
use gpt2::{find_weights, inspect, load_model, EnvConfig, Gpt2Config, ModelMeta};
use std::path::PathBuf;
use std::process;

#[derive(Parser)]
#[command(name = "gpt2")]
#[command(version = "0.5.0")]
#[command(about = "Inspect and run GPT-2 checkpoints", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct ModelArgs {
    /// Size preset: 117M, 345M, 762M or 1.5B
    #[arg(short, long)]
    size: Option<String>,
    /// Hugging Face config.json, overrides --size
    #[arg(long)]
    config: Option<PathBuf>,
    /// Key/value cache limit in tokens
    #[arg(long)]
    cache_limit: Option<usize>,
    /// The output head reuses the token embedding
    #[arg(long)]
    tied: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the resolved hyperparameters
    Show {
        #[command(flatten)]
        model: ModelArgs,
    },
    /// List every checkpoint tensor name and shape
    Names {
        #[command(flatten)]
        model: ModelArgs,
    },
    /// Compare a checkpoint against the expected tensor names
    Verify {
        /// safetensors file or directory
        weights: Option<PathBuf>,
        #[command(flatten)]
        model: ModelArgs,
    },
    /// Generate token ids from a prompt of token ids
    Run {
        /// Comma-separated prompt token ids
        #[arg(short, long, value_delimiter = ',', required = true)]
        tokens: Vec<u32>,
        #[arg(short, long)]
        weights: Option<PathBuf>,
        #[arg(short = 'n', long, default_value_t = 20)]
        max_new_tokens: usize,
        #[arg(long)]
        temperature: Option<f64>,
        #[arg(long)]
        top_p: Option<f64>,
        #[arg(long, default_value_t = 299792458)]
        seed: u64,
        /// Stop after this token id
        #[arg(long, default_value_t = 50256)]
        eos: u32,
        #[command(flatten)]
        model: ModelArgs,
    },
}

fn resolve_config(args: &ModelArgs, env: &EnvConfig) -> Result<Gpt2Config> {
    let cache_limit = args.cache_limit.unwrap_or(env.cache_limit);
    let mut config = match &args.config {
        Some(path) => Gpt2Config::from_hf_file(path, cache_limit)
            .with_context(|| format!("reading {}", path.display()))?,
        None => Gpt2Config::from_label(cache_limit, args.size.as_deref().unwrap_or(&env.size))?,
    };
    if args.tied {
        config.tie_word_embeddings = true;
    }
    config.validate()?;
    Ok(config)
}

fn weights_path(arg: Option<PathBuf>, env: &EnvConfig) -> PathBuf {
    arg.unwrap_or_else(|| env.models_dir.clone())
}

fn show(config: &Gpt2Config) {
    let meta = ModelMeta::from_config("gpt2", config);
    println!("architecture        {}", meta.architecture);
    println!("parameters          {}", meta.parameter_count);
    println!("vocab_size          {}", config.vocab_size);
    println!("hidden_size         {}", config.hidden_size);
    println!("intermediate_size   {}", config.intermediate_size);
    println!("layers              {}", config.num_hidden_layers);
    println!("heads               {} (kv {})", config.num_attention_heads, config.num_key_value_heads);
    println!("head_dim            {}", config.head_dim());
    println!("max_positions       {}", config.max_position_embeddings);
    println!("cache_limit         {}", config.cache_limit);
    println!("position_encoding   {:?}", config.position_encoding);
    println!("tied_head           {}", config.tie_word_embeddings);
}

fn names(config: &Gpt2Config) {
    for spec in config.names.tensor_specs(config) {
        println!("{:<40} {:?}", spec.name, spec.shape);
    }
}

fn verify(weights: PathBuf, config: &Gpt2Config) -> Result<()> {
    let files = find_weights(&weights)?;
    let report = inspect(&files, config)?;
    println!("matched     {}", report.matched);
    for name in &report.missing {
        println!("missing     {}", name);
    }
    for bad in &report.mismatched {
        println!("shape       {} expected {:?} got {:?}", bad.name, bad.expected, bad.actual);
    }
    for name in &report.unexpected {
        println!("unexpected  {}", name);
    }
    if !report.is_complete() {
        bail!("checkpoint {} does not match the model", weights.display());
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn run(
    tokens: Vec<u32>,
    weights: PathBuf,
    max_new_tokens: usize,
    temperature: Option<f64>,
    top_p: Option<f64>,
    seed: u64,
    eos: u32,
    config: &Gpt2Config,
    env: &EnvConfig,
) -> Result<()> {
    let device = env.device.device()?;
    let files = find_weights(&weights)?;
    let lm = load_model(&files, config, DType::F32, &device)?;

    let mut sampler = LogitsProcessor::new(seed, temperature, top_p);
    let start = std::time::Instant::now();
    let generated = lm.generate(&tokens, max_new_tokens, &mut sampler, Some(eos))?;
    tracing::info!(
        tokens = generated.len(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "generation finished"
    );

    let ids: Vec<String> = generated.iter().map(|t| t.to_string()).collect();
    println!("{}", ids.join(","));
    Ok(())
}

fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt().with_max_level(level).with_writer(std::io::stderr).init();

    let result = EnvConfig::from_env().map_err(anyhow::Error::from).and_then(|env| match cli.command {
        Commands::Show { model } => resolve_config(&model, &env).map(|c| show(&c)),
        Commands::Names { model } => resolve_config(&model, &env).map(|c| names(&c)),
        Commands::Verify { weights, model } => {
            let config = resolve_config(&model, &env)?;
            verify(weights_path(weights, &env), &config)
        }
        Commands::Run {
            tokens,
            weights,
            max_new_tokens,
            temperature,
            top_p,
            seed,
            eos,
            model,
        } => {
            let config = resolve_config(&model, &env)?;
            run(
                tokens,
                weights_path(weights, &env),
                max_new_tokens,
                temperature,
                top_p,
                seed,
                eos,
                &config,
                &env,
            )
        }
    });

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}
