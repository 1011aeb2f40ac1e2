pub mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "dualft")]
#[command(about = "Dual-objective LoRA fine-tuning for causal LMs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fine-tune a model with the dual target/rationale objective
    Train {
        /// Model preset, HuggingFace name, or local checkpoint directory
        #[arg(long, default_value = "codellama/CodeLlama-7b-hf")]
        model_id: String,
        /// Dataset identifier or directory of .jsonl shards
        #[arg(long, default_value = "zhaospei/cmg_allinone")]
        dataset_id: String,
        /// Destination for adapters, checkpoints, and logs
        #[arg(long, default_value = "tmp")]
        output_dir: String,
        /// Per-step training batch size
        #[arg(long, default_value = "8")]
        batch_size: usize,
        /// Load base weights through 8-bit quantization
        #[arg(long)]
        load_in_8bit: bool,
        /// Weight of the target objective; the rationale objective gets 1 - alpha
        #[arg(long, default_value = "0.5")]
        alpha: f32,
        /// AdamW learning rate
        #[arg(long, default_value = "1e-4")]
        learning_rate: f32,
        /// Number of passes over the dataset
        #[arg(long, default_value = "1")]
        epochs: usize,
        /// Micro batches summed into one optimizer step
        #[arg(long, default_value = "2")]
        grad_accum: usize,
        /// Token length each encoded view is truncated to
        #[arg(long)]
        max_seq_len: Option<usize>,
        /// Hard cap on optimizer steps (0 = run the epochs out)
        #[arg(long, default_value = "0")]
        max_steps: usize,
        /// Shuffle seed
        #[arg(long, default_value = "42")]
        seed: u64,
        /// Log and export metrics every N steps
        #[arg(long, default_value = "10")]
        logging_steps: usize,
        /// LoRA rank
        #[arg(long, default_value = "8")]
        lora_rank: usize,
        /// LoRA alpha (adapter scale = alpha / rank)
        #[arg(long, default_value = "32")]
        lora_alpha: usize,
        /// Record per-step timings to a JSONL trace
        #[arg(long)]
        profile: bool,
        /// Resume from the newest checkpoint in the output directory
        #[arg(long)]
        resume: bool,
        /// Append step metrics to this JSONL file
        #[arg(long)]
        metrics_file: Option<String>,
    },
    /// Sample from a base model with trained adapters applied
    Generate {
        /// Model preset, HuggingFace name, or local checkpoint directory
        #[arg(long, default_value = "codellama/CodeLlama-7b-hf")]
        model_id: String,
        /// Adapter .safetensors file produced by `train`
        #[arg(long)]
        adapters: Option<String>,
        /// Prompt text
        #[arg(long)]
        prompt: String,
        /// Maximum tokens to sample
        #[arg(long, default_value = "128")]
        max_new_tokens: usize,
        /// Sampling temperature (0 = greedy)
        #[arg(long, default_value = "0.0")]
        temperature: f32,
        /// Load base weights through 8-bit quantization
        #[arg(long)]
        load_in_8bit: bool,
    },
    /// Check a dataset directory parses and report field coverage
    Validate {
        /// Directory of .jsonl shards
        #[arg(long)]
        dataset_dir: String,
    },
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Train {
            model_id,
            dataset_id,
            output_dir,
            batch_size,
            load_in_8bit,
            alpha,
            learning_rate,
            epochs,
            grad_accum,
            max_seq_len,
            max_steps,
            seed,
            logging_steps,
            lora_rank,
            lora_alpha,
            profile,
            resume,
            metrics_file,
        } => commands::train(commands::TrainArgs {
            model_id,
            dataset_id,
            output_dir,
            batch_size,
            load_in_8bit,
            alpha,
            learning_rate,
            epochs,
            grad_accum,
            max_seq_len,
            max_steps,
            seed,
            logging_steps,
            lora_rank,
            lora_alpha,
            profile,
            resume,
            metrics_file,
        }),
        Commands::Generate {
            model_id,
            adapters,
            prompt,
            max_new_tokens,
            temperature,
            load_in_8bit,
        } => commands::generate(
            model_id,
            adapters,
            prompt,
            max_new_tokens,
            temperature,
            load_in_8bit,
        ),
        Commands::Validate { dataset_dir } => commands::validate(dataset_dir),
    }
}
