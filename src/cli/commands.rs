//! CLI command implementations

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use mlx_rs::Array;

use dualft::checkpoints::CheckpointManager;
use dualft::config::model::AVAILABLE_MODELS;
use dualft::config::Config;
use dualft::data::{prepare, DualObjectiveCollator};
use dualft::model::{LlamaConfig, LlamaForCausalLM, ModelLoader, TokenizerWrapper};
use dualft::training::{DualObjectiveTrainer, ProfilerSchedule, StepProfiler};

pub struct TrainArgs {
    pub model_id: String,
    pub dataset_id: String,
    pub output_dir: String,
    pub batch_size: usize,
    pub load_in_8bit: bool,
    pub alpha: f32,
    pub learning_rate: f32,
    pub epochs: usize,
    pub grad_accum: usize,
    pub max_seq_len: Option<usize>,
    pub max_steps: usize,
    pub seed: u64,
    pub logging_steps: usize,
    pub lora_rank: usize,
    pub lora_alpha: usize,
    pub profile: bool,
    pub resume: bool,
    pub metrics_file: Option<String>,
}

/// Resolve a model preset to its full name; non-presets pass through as
/// HuggingFace names or local paths.
fn resolve_model_name(model_id: &str) -> String {
    if let Some(preset) = AVAILABLE_MODELS.get(model_id) {
        preset
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or(model_id)
            .to_string()
    } else {
        model_id.to_string()
    }
}

/// Resolve a dataset identifier to a local directory of .jsonl shards.
/// Direct paths win; hub-style names are looked up under `data/`.
fn resolve_dataset_dir(dataset_id: &str) -> Result<PathBuf> {
    let direct = PathBuf::from(dataset_id);
    if direct.is_dir() {
        return Ok(direct);
    }

    let local = PathBuf::from("data").join(dataset_id.replace('/', "--"));
    if local.is_dir() {
        return Ok(local);
    }

    anyhow::bail!(
        "Dataset not found: {} (looked at {} and {}).\n\
         Export the dataset as .jsonl shards with prompt/target/rationale \
         fields and point --dataset-id at that directory.",
        dataset_id,
        direct.display(),
        local.display()
    )
}

fn load_model(
    model_id: &str,
    load_in_8bit: bool,
    config: &Config,
) -> Result<(LlamaForCausalLM, PathBuf)> {
    let loader = ModelLoader::new(model_id).with_8bit(load_in_8bit);
    let model_dir = loader.resolve_model_dir()?;

    let llama_config = LlamaConfig::from_json(&model_dir.join("config.json"))?;
    println!(
        "Initializing Llama model: {} layers, {} heads, vocab {}",
        llama_config.num_hidden_layers, llama_config.num_attention_heads, llama_config.vocab_size
    );

    let mut model = LlamaForCausalLM::new(llama_config, &config.model.lora())
        .map_err(|e| anyhow::anyhow!("Failed to build model: {}", e))?;

    let weights = loader.load_safetensors()?;
    model.load_base_weights(weights)?;

    Ok((model, model_dir))
}

pub fn train(args: TrainArgs) -> Result<()> {
    let mut config = Config::default();
    config.model.model_id = resolve_model_name(&args.model_id);
    config.model.load_in_8bit = args.load_in_8bit;
    config.model.lora_rank = args.lora_rank;
    config.model.lora_alpha = args.lora_alpha;
    config.objective.alpha = args.alpha;
    config.training.batch_size = args.batch_size;
    config.training.learning_rate = args.learning_rate;
    config.training.num_train_epochs = args.epochs;
    config.training.gradient_accumulation_steps = args.grad_accum;
    config.training.max_steps = args.max_steps;
    config.training.logging_steps = args.logging_steps;
    if let Some(len) = args.max_seq_len {
        config.training.max_seq_length = len;
    }
    config.seed = args.seed;
    config.paths.output_dir = args.output_dir;
    config.paths.metrics_file = args.metrics_file;
    config.paths.dataset_dir = resolve_dataset_dir(&args.dataset_id)?
        .to_string_lossy()
        .into_owned();
    config.performance.profile = args.profile;
    config.validate()?;

    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("Training Configuration");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("  Model:          {}", config.model.model_id);
    println!("  Dataset:        {}", config.paths.dataset_dir);
    println!("  Output:         {}", config.paths.output_dir);
    println!("  Batch size:     {}", config.training.batch_size);
    println!("  Grad accum:     {}", config.training.gradient_accumulation_steps);
    println!("  Epochs:         {}", config.training.num_train_epochs);
    println!("  Learning rate:  {:.2e}", config.training.learning_rate);
    println!("  Alpha:          {}", config.objective.alpha);
    println!("  LoRA rank:      {}", config.model.lora_rank);
    println!("  LoRA alpha:     {}", config.model.lora_alpha);
    println!("  8-bit weights:  {}", config.model.load_in_8bit);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!();

    let (model, model_dir) = load_model(
        &config.model.model_id,
        config.model.load_in_8bit,
        &config,
    )?;

    let tokenizer = TokenizerWrapper::from_model_dir(&model_dir)?;
    let collator = DualObjectiveCollator::new(tokenizer, config.training.max_seq_length);

    let manager = CheckpointManager::new(
        &config.paths.checkpoint_dir(),
        config.performance.checkpoint_keep_last_n,
    )?;

    let mut trainer = DualObjectiveTrainer::new(model, collator, config.clone())?
        .with_checkpoint_manager(manager);

    if let Some(metrics_path) = &config.paths.metrics_file {
        trainer = trainer.with_metrics_file(PathBuf::from(metrics_path));
    }

    if config.performance.profile {
        let schedule = ProfilerSchedule {
            wait: config.performance.profiler_wait,
            warmup: config.performance.profiler_warmup,
            active: config.performance.profiler_active,
            repeat: config.performance.profiler_repeat,
        };
        trainer = trainer.with_profiler(StepProfiler::new(schedule, &config.paths.trace_file())?);
    }

    if args.resume {
        match trainer.resume()? {
            Some(step) => println!("Resuming from checkpoint at step {}", step),
            None => println!("No checkpoint found, starting fresh"),
        }
    }

    trainer.train()
}

pub fn generate(
    model_id: String,
    adapters: Option<String>,
    prompt: String,
    max_new_tokens: usize,
    temperature: f32,
    load_in_8bit: bool,
) -> Result<()> {
    let mut config = Config::default();
    config.model.model_id = resolve_model_name(&model_id);

    let (mut model, model_dir) = load_model(&config.model.model_id, load_in_8bit, &config)?;

    if let Some(adapter_path) = adapters {
        let tensors = ModelLoader::load_flat_safetensors(&adapter_path)
            .with_context(|| format!("Failed to load adapters from {}", adapter_path))?;
        let restored = model.set_adapter_parameters(&tensors);
        anyhow::ensure!(
            restored == tensors.len(),
            "Adapter mismatch: {} of {} tensors applied. \
             Were the adapters trained with different LoRA settings?",
            restored,
            tensors.len()
        );
        println!("Applied {} adapter tensors", restored);
    }

    let tokenizer = TokenizerWrapper::from_model_dir(&model_dir)?;
    let ids = tokenizer.encode(&prompt, true)?;
    let ids_i32: Vec<i32> = ids.iter().map(|&t| t as i32).collect();
    let input = Array::from_slice(&ids_i32, &[1, ids_i32.len() as i32]);

    let generated = model
        .generate(
            &input,
            max_new_tokens,
            temperature,
            tokenizer.eos_token_id() as i32,
        )
        .map_err(|e| anyhow::anyhow!("Generation failed: {}", e))?;

    let generated_u32: Vec<u32> = generated.iter().map(|&t| t as u32).collect();
    let text = tokenizer.decode(&generated_u32, true)?;

    println!("{}{}", prompt, text);
    Ok(())
}

pub fn validate(dataset_dir: String) -> Result<()> {
    let dir = Path::new(&dataset_dir);
    println!("Validating dataset: {}", dir.display());

    let report = prepare::inspect_dataset(dir)?;

    println!("  Files:            {}", report.files);
    println!("  Examples:         {}", report.examples);
    println!("  Malformed lines:  {}", report.skipped);
    println!("  Empty rationales: {}", report.empty_rationales);

    if report.examples == 0 {
        anyhow::bail!("Dataset has no usable examples");
    }
    if report.skipped > 0 {
        println!();
        println!(
            "⚠️  {} lines failed to parse and will be skipped during training",
            report.skipped
        );
    }
    if report.empty_rationales > 0 {
        println!(
            "⚠️  {} examples have empty rationales; their explain view trains on nothing",
            report.empty_rationales
        );
    }

    Ok(())
}
