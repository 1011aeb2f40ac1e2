use std::collections::HashMap;
use std::rc::Rc;

use mlx_rs::builder::Builder;
use mlx_rs::error::Exception;
use mlx_rs::module::{Module, ModuleParamMut, ModuleParamRef, ModuleParameters, Param};
use mlx_rs::nested::NestedValue;
use mlx_rs::nn::{Embedding, Linear, RmsNorm, RmsNormBuilder, Rope, RopeBuilder};
use mlx_rs::Array;
use serde::{Deserialize, Serialize};

use super::loader::WeightTensor;
use super::lora::{LoraConfig, LoraLinear};

/// Llama model configuration parsed from config.json
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlamaConfig {
    pub hidden_size: i32,
    pub intermediate_size: i32,
    pub num_attention_heads: i32,
    pub num_key_value_heads: i32,
    pub num_hidden_layers: i32,
    pub vocab_size: i32,
    pub rms_norm_eps: f32,
    pub rope_theta: f32,
    pub max_position_embeddings: i32,
    #[serde(default)]
    pub attention_bias: bool,
    #[serde(default)]
    pub mlp_bias: bool,
    #[serde(default)]
    pub tie_word_embeddings: bool,
}

impl LlamaConfig {
    pub fn from_json(path: &std::path::Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Estimate total base model parameters
    pub fn estimate_num_parameters(&self) -> u64 {
        let head_dim = self.hidden_size / self.num_attention_heads;

        let embedding_params = (self.vocab_size * self.hidden_size) as u64;

        let attention_params_per_layer = ((self.hidden_size * self.num_attention_heads * head_dim)
            + 2 * (self.hidden_size * self.num_key_value_heads * head_dim)
            + (self.num_attention_heads * head_dim * self.hidden_size))
            as u64;

        let mlp_params_per_layer = (2 * (self.hidden_size * self.intermediate_size)
            + (self.intermediate_size * self.hidden_size)) as u64;

        let norm_params_per_layer = (2 * self.hidden_size) as u64;

        let params_per_layer =
            attention_params_per_layer + mlp_params_per_layer + norm_params_per_layer;
        let total_layer_params = params_per_layer * self.num_hidden_layers as u64;

        let output_params = (self.hidden_size + self.vocab_size * self.hidden_size) as u64;

        embedding_params + total_layer_params + output_params
    }
}

/// Attention projection that is either a frozen linear layer or a
/// LoRA-adapted one, depending on the configured target modules.
#[derive(Debug, Clone)]
pub enum Projection {
    Plain(Linear),
    Adapted(LoraLinear),
}

impl Projection {
    fn new(
        in_features: i32,
        out_features: i32,
        adapted: bool,
        lora: &LoraConfig,
    ) -> Result<Self, Exception> {
        if adapted {
            Ok(Self::Adapted(LoraLinear::new(
                in_features,
                out_features,
                lora.rank,
                lora.lora_alpha,
                lora.dropout,
            )?))
        } else {
            Ok(Self::Plain(Linear::new(in_features, out_features)?))
        }
    }

    pub fn forward(&mut self, x: &Array) -> Result<Array, Exception> {
        match self {
            Self::Plain(linear) => linear.forward(x),
            Self::Adapted(lora) => lora.forward(x),
        }
    }

    pub fn adapter(&self) -> Option<&LoraLinear> {
        match self {
            Self::Plain(_) => None,
            Self::Adapted(lora) => Some(lora),
        }
    }

    pub fn adapter_mut(&mut self) -> Option<&mut LoraLinear> {
        match self {
            Self::Plain(_) => None,
            Self::Adapted(lora) => Some(lora),
        }
    }

    /// Replace the frozen base weight, leaving any adapters untouched.
    pub fn set_base_weight(&mut self, weight: Array) {
        match self {
            Self::Plain(linear) => linear.weight = Param::new(weight),
            Self::Adapted(lora) => lora.weight = weight,
        }
    }
}

/// Grouped Query Attention for Llama
#[derive(Debug, Clone)]
pub struct LlamaAttention {
    pub num_attention_heads: i32,
    pub num_key_value_heads: i32,
    pub q_proj: Projection,
    pub k_proj: Projection,
    pub v_proj: Projection,
    pub o_proj: Projection,
    pub rope: Rope,
    pub head_dim: i32,
    pub num_kv_groups: i32,
}

impl LlamaAttention {
    pub fn new(config: &LlamaConfig, lora: &LoraConfig) -> Result<Self, Exception> {
        let head_dim = config.hidden_size / config.num_attention_heads;
        let num_kv_groups = config.num_attention_heads / config.num_key_value_heads;

        let q_proj = Projection::new(
            config.hidden_size,
            config.num_attention_heads * head_dim,
            lora.targets("q_proj"),
            lora,
        )?;
        let k_proj = Projection::new(
            config.hidden_size,
            config.num_key_value_heads * head_dim,
            lora.targets("k_proj"),
            lora,
        )?;
        let v_proj = Projection::new(
            config.hidden_size,
            config.num_key_value_heads * head_dim,
            lora.targets("v_proj"),
            lora,
        )?;
        let o_proj = Projection::new(
            config.num_attention_heads * head_dim,
            config.hidden_size,
            lora.targets("o_proj"),
            lora,
        )?;

        let rope = RopeBuilder::new(head_dim).base(config.rope_theta).build()?;

        Ok(Self {
            num_attention_heads: config.num_attention_heads,
            num_key_value_heads: config.num_key_value_heads,
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            rope,
            head_dim,
            num_kv_groups,
        })
    }

    pub fn forward(&mut self, x: &Array, mask: Option<&Array>) -> Result<Array, Exception> {
        let (batch_size, seq_len) = (x.dim(0), x.dim(1));

        let mut q = self.q_proj.forward(x)?;
        let mut k = self.k_proj.forward(x)?;
        let mut v = self.v_proj.forward(x)?;

        // [B, L, heads * head_dim] -> [B, L, heads, head_dim]
        q = q.reshape(&[batch_size, seq_len, self.num_attention_heads, self.head_dim])?;
        k = k.reshape(&[batch_size, seq_len, self.num_key_value_heads, self.head_dim])?;
        v = v.reshape(&[batch_size, seq_len, self.num_key_value_heads, self.head_dim])?;

        q = self.rope.forward(&q)?;
        k = self.rope.forward(&k)?;

        // [B, heads, L, head_dim]
        q = q.transpose_axes(&[0, 2, 1, 3])?;
        k = k.transpose_axes(&[0, 2, 1, 3])?;
        v = v.transpose_axes(&[0, 2, 1, 3])?;

        if self.num_kv_groups > 1 {
            k = self.repeat_kv(k, self.num_kv_groups)?;
            v = self.repeat_kv(v, self.num_kv_groups)?;
        }

        let scale = Array::from_f32(1.0 / (self.head_dim as f32).sqrt());

        let k_t = k.transpose_axes(&[0, 1, 3, 2])?;
        let mut scores = q.matmul(&k_t)?;
        scores = scores.multiply(&scale)?;

        if let Some(mask) = mask {
            scores = scores.add(mask)?;
        }

        let attn_weights = mlx_rs::ops::softmax_axis(&scores, -1, false)?;
        let attn_output = attn_weights.matmul(&v)?;

        // [B, heads, L, head_dim] -> [B, L, heads * head_dim]
        let attn_output = attn_output.transpose_axes(&[0, 2, 1, 3])?;
        let attn_output = attn_output.reshape(&[batch_size, seq_len, -1])?;

        self.o_proj.forward(&attn_output)
    }

    fn repeat_kv(&self, x: Array, n_rep: i32) -> Result<Array, Exception> {
        if n_rep == 1 {
            return Ok(x);
        }

        let (b, num_kv_heads, seq_len, head_dim) = (x.dim(0), x.dim(1), x.dim(2), x.dim(3));

        // [B, num_kv_heads, L, head_dim] -> [B, num_kv_heads, n_rep, L, head_dim]
        let x = x.reshape(&[b, num_kv_heads, 1, seq_len, head_dim])?;

        let repeated: Vec<Array> = (0..n_rep).map(|_| x.clone()).collect();
        let refs: Vec<&Array> = repeated.iter().collect();
        let x = mlx_rs::ops::concatenate_axis(&refs, 2)?;

        x.reshape(&[b, num_kv_heads * n_rep, seq_len, head_dim])
    }
}

/// Llama MLP with gated activation
#[derive(Debug, Clone)]
pub struct LlamaMLP {
    pub gate_proj: Linear,
    pub up_proj: Linear,
    pub down_proj: Linear,
}

impl LlamaMLP {
    pub fn new(config: &LlamaConfig) -> Result<Self, Exception> {
        let gate_proj = Linear::new(config.hidden_size, config.intermediate_size)?;
        let up_proj = Linear::new(config.hidden_size, config.intermediate_size)?;
        let down_proj = Linear::new(config.intermediate_size, config.hidden_size)?;

        Ok(Self {
            gate_proj,
            up_proj,
            down_proj,
        })
    }

    pub fn forward(&mut self, x: &Array) -> Result<Array, Exception> {
        let gate = self.gate_proj.forward(x)?;
        let gate = mlx_rs::nn::silu(&gate)?;

        let up = self.up_proj.forward(x)?;

        let hidden = gate.multiply(&up)?;
        self.down_proj.forward(&hidden)
    }
}

/// Single Llama decoder layer
#[derive(Debug, Clone)]
pub struct LlamaDecoderLayer {
    pub self_attn: LlamaAttention,
    pub mlp: LlamaMLP,
    pub input_layernorm: RmsNorm,
    pub post_attention_layernorm: RmsNorm,
}

impl LlamaDecoderLayer {
    pub fn new(config: &LlamaConfig, lora: &LoraConfig) -> Result<Self, Exception> {
        let self_attn = LlamaAttention::new(config, lora)?;
        let mlp = LlamaMLP::new(config)?;
        let input_layernorm = RmsNormBuilder::new(config.hidden_size)
            .eps(config.rms_norm_eps)
            .build()?;
        let post_attention_layernorm = RmsNormBuilder::new(config.hidden_size)
            .eps(config.rms_norm_eps)
            .build()?;

        Ok(Self {
            self_attn,
            mlp,
            input_layernorm,
            post_attention_layernorm,
        })
    }

    pub fn forward(&mut self, x: &Array, mask: Option<&Array>) -> Result<Array, Exception> {
        // Pre-norm attention with residual
        let normed = self.input_layernorm.forward(x)?;
        let attn_output = self.self_attn.forward(&normed, mask)?;
        let x = x.add(&attn_output)?;

        // Pre-norm MLP with residual
        let normed = self.post_attention_layernorm.forward(&x)?;
        let mlp_output = self.mlp.forward(&normed)?;
        x.add(&mlp_output)
    }
}

/// Full Llama model (without lm_head)
#[derive(Debug, Clone)]
pub struct LlamaModel {
    pub config: LlamaConfig,
    pub embed_tokens: Embedding,
    pub layers: Vec<LlamaDecoderLayer>,
    pub norm: RmsNorm,
}

impl LlamaModel {
    pub fn new(config: LlamaConfig, lora: &LoraConfig) -> Result<Self, Exception> {
        let embed_tokens = Embedding::new(config.vocab_size, config.hidden_size)?;

        let mut layers = Vec::new();
        for _ in 0..config.num_hidden_layers {
            layers.push(LlamaDecoderLayer::new(&config, lora)?);
        }

        let norm = RmsNormBuilder::new(config.hidden_size)
            .eps(config.rms_norm_eps)
            .build()?;

        Ok(Self {
            config,
            embed_tokens,
            layers,
            norm,
        })
    }

    pub fn forward(&mut self, input_ids: &Array) -> Result<Array, Exception> {
        let mut hidden_states = self.embed_tokens.forward(input_ids)?;

        let seq_len = input_ids.dim(1);
        let mask = self.create_causal_mask(seq_len)?;

        for layer in &mut self.layers {
            hidden_states = layer.forward(&hidden_states, Some(&mask))?;
        }

        self.norm.forward(&hidden_states)
    }

    fn create_causal_mask(&self, seq_len: i32) -> Result<Array, Exception> {
        // Additive mask: 0 for visible positions, large negative for future ones
        let indices = mlx_rs::ops::arange::<_, f32>(0, seq_len, 1)?;
        let row = mlx_rs::ops::expand_dims(&indices, 0)?;
        let col = mlx_rs::ops::expand_dims(&indices, 1)?;

        // mask[i, j] != 0 where j > i
        let mask = row.gt(&col)?;

        let mask = mask.as_type::<f32>()?;
        let neg_inf = Array::from_f32(-1e9_f32);
        mask.multiply(&neg_inf)
    }
}

/// Llama model for causal language modeling with LoRA adapters on the
/// configured attention projections.
#[derive(Debug, Clone)]
pub struct LlamaForCausalLM {
    pub model: LlamaModel,
    pub lm_head: Linear,
}

impl LlamaForCausalLM {
    pub fn new(config: LlamaConfig, lora: &LoraConfig) -> Result<Self, Exception> {
        let model = LlamaModel::new(config.clone(), lora)?;
        let lm_head = Linear::new(config.hidden_size, config.vocab_size)?;

        Ok(Self { model, lm_head })
    }

    pub fn forward(&mut self, input_ids: &Array) -> Result<Array, Exception> {
        let hidden_states = self.model.forward(input_ids)?;
        self.lm_head.forward(&hidden_states)
    }

    pub fn config(&self) -> &LlamaConfig {
        &self.model.config
    }

    /// Number of trainable adapter values.
    pub fn num_adapter_params(&self) -> usize {
        let mut total = 0;
        for layer in &self.model.layers {
            for proj in [
                &layer.self_attn.q_proj,
                &layer.self_attn.k_proj,
                &layer.self_attn.v_proj,
                &layer.self_attn.o_proj,
            ] {
                if let Some(adapter) = proj.adapter() {
                    total += adapter.num_adapter_params();
                }
            }
        }
        total
    }

    /// Toggle adapter dropout. The trainer enables this for the duration of
    /// the loop; generation and evaluation keep it off.
    pub fn set_training(&mut self, training: bool) {
        for layer in &mut self.model.layers {
            for proj in [
                &mut layer.self_attn.q_proj,
                &mut layer.self_attn.k_proj,
                &mut layer.self_attn.v_proj,
                &mut layer.self_attn.o_proj,
            ] {
                if let Some(adapter) = proj.adapter_mut() {
                    adapter.training = training;
                }
            }
        }
    }

    /// Load pretrained base weights keyed in HuggingFace format
    /// (`model.layers.{i}.self_attn.q_proj.weight`, ...). Adapter matrices
    /// are untouched. Returns (loaded, missing) key counts.
    ///
    /// The map is consumed: int8 tensors dequantize one at a time as they
    /// are installed, so no full-precision copy of the checkpoint exists
    /// alongside the quantized staging.
    pub fn load_base_weights(
        &mut self,
        mut weights: HashMap<String, WeightTensor>,
    ) -> anyhow::Result<(usize, usize)> {
        let mut loaded = 0usize;
        let mut missing: Vec<String> = Vec::new();

        if let Some(w) = weights.remove("model.embed_tokens.weight") {
            self.model.embed_tokens.weight = Param::new(w.into_array()?);
            loaded += 1;
        } else {
            missing.push("model.embed_tokens.weight".to_string());
        }

        for (i, layer) in self.model.layers.iter_mut().enumerate() {
            let prefix = format!("model.layers.{}", i);

            for (name, proj) in [
                ("q_proj", &mut layer.self_attn.q_proj),
                ("k_proj", &mut layer.self_attn.k_proj),
                ("v_proj", &mut layer.self_attn.v_proj),
                ("o_proj", &mut layer.self_attn.o_proj),
            ] {
                let key = format!("{}.self_attn.{}.weight", prefix, name);
                if let Some(w) = weights.remove(&key) {
                    proj.set_base_weight(w.into_array()?);
                    loaded += 1;
                } else {
                    missing.push(key);
                }
            }

            for (key, target) in [
                (
                    format!("{}.mlp.gate_proj.weight", prefix),
                    &mut layer.mlp.gate_proj,
                ),
                (
                    format!("{}.mlp.up_proj.weight", prefix),
                    &mut layer.mlp.up_proj,
                ),
                (
                    format!("{}.mlp.down_proj.weight", prefix),
                    &mut layer.mlp.down_proj,
                ),
            ] {
                if let Some(w) = weights.remove(&key) {
                    target.weight = Param::new(w.into_array()?);
                    loaded += 1;
                } else {
                    missing.push(key);
                }
            }

            for (key, target) in [
                (
                    format!("{}.input_layernorm.weight", prefix),
                    &mut layer.input_layernorm,
                ),
                (
                    format!("{}.post_attention_layernorm.weight", prefix),
                    &mut layer.post_attention_layernorm,
                ),
            ] {
                if let Some(w) = weights.remove(&key) {
                    target.weight = Param::new(w.into_array()?);
                    loaded += 1;
                } else {
                    missing.push(key);
                }
            }
        }

        if let Some(w) = weights.remove("model.norm.weight") {
            self.model.norm.weight = Param::new(w.into_array()?);
            loaded += 1;
        } else {
            missing.push("model.norm.weight".to_string());
        }

        // Tied-embedding checkpoints ship no separate lm_head tensor
        if let Some(w) = weights.remove("lm_head.weight") {
            self.lm_head.weight = Param::new(w.into_array()?);
            loaded += 1;
        } else if self.model.config.tie_word_embeddings {
            let embed = (*self.model.embed_tokens.weight).clone();
            self.lm_head.weight = Param::new(embed);
        } else {
            missing.push("lm_head.weight".to_string());
        }

        tracing::info!(
            loaded,
            missing = missing.len(),
            "loaded base weights into model"
        );
        if !missing.is_empty() {
            tracing::warn!(
                "missing weight tensors (first 10): {:?}",
                &missing[..missing.len().min(10)]
            );
        }

        if loaded == 0 {
            anyhow::bail!("no weight tensors matched the model; wrong checkpoint layout?");
        }

        Ok((loaded, missing.len()))
    }

    /// Flat adapter tensors keyed like
    /// `model.layers.{i}.self_attn.q_proj.lora_a`, suitable for safetensors.
    pub fn adapter_parameters(&self) -> HashMap<String, Array> {
        let mut out = HashMap::new();
        for (i, layer) in self.model.layers.iter().enumerate() {
            let prefix = format!("model.layers.{}.self_attn", i);
            for (name, proj) in [
                ("q_proj", &layer.self_attn.q_proj),
                ("k_proj", &layer.self_attn.k_proj),
                ("v_proj", &layer.self_attn.v_proj),
                ("o_proj", &layer.self_attn.o_proj),
            ] {
                if let Some(adapter) = proj.adapter() {
                    out.insert(
                        format!("{}.{}.lora_a", prefix, name),
                        adapter.lora_a.clone(),
                    );
                    out.insert(
                        format!("{}.{}.lora_b", prefix, name),
                        adapter.lora_b.clone(),
                    );
                }
            }
        }
        out
    }

    /// Restore adapter tensors saved by [`Self::adapter_parameters`].
    /// Returns how many tensors were restored.
    pub fn set_adapter_parameters(&mut self, params: &HashMap<String, Array>) -> usize {
        let mut restored = 0usize;
        for (i, layer) in self.model.layers.iter_mut().enumerate() {
            let prefix = format!("model.layers.{}.self_attn", i);
            for (name, proj) in [
                ("q_proj", &mut layer.self_attn.q_proj),
                ("k_proj", &mut layer.self_attn.k_proj),
                ("v_proj", &mut layer.self_attn.v_proj),
                ("o_proj", &mut layer.self_attn.o_proj),
            ] {
                if let Some(adapter) = proj.adapter_mut() {
                    if let Some(a) = params.get(&format!("{}.{}.lora_a", prefix, name)) {
                        adapter.lora_a = a.clone();
                        restored += 1;
                    }
                    if let Some(b) = params.get(&format!("{}.{}.lora_b", prefix, name)) {
                        adapter.lora_b = b.clone();
                        restored += 1;
                    }
                }
            }
        }
        restored
    }

    /// Generate tokens autoregressively from `input_ids` [1, seq_len].
    ///
    /// `temperature` 0.0 means greedy decoding; generation stops at
    /// `eos_token_id`. Returns only the newly generated tokens.
    pub fn generate(
        &mut self,
        input_ids: &Array,
        max_new_tokens: usize,
        temperature: f32,
        eos_token_id: i32,
    ) -> Result<Vec<i32>, Exception> {
        if input_ids.dim(0) != 1 {
            return Err(Exception::custom(
                "generate() only supports batch_size=1 currently",
            ));
        }

        let mut generated: Vec<i32> = input_ids.as_slice::<i32>().to_vec();
        let initial_len = generated.len();

        for _ in 0..max_new_tokens {
            let seq_len = generated.len() as i32;
            let input = Array::from_slice(&generated, &[1, seq_len]);

            let logits = self.forward(&input)?;

            let vocab_size = logits.dim(2);
            let logits_vec: Vec<f32> = logits.as_slice::<f32>().to_vec();

            // logits[0, seq_len - 1, :]
            let last_start = ((seq_len - 1) * vocab_size) as usize;
            let last_end = (seq_len * vocab_size) as usize;
            let last_logits = Array::from_slice(&logits_vec[last_start..last_end], &[vocab_size]);

            let next_token = if temperature < 1e-6 {
                let values: Vec<f32> = last_logits.as_slice::<f32>().to_vec();
                values
                    .iter()
                    .enumerate()
                    .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
                    .map(|(idx, _)| idx as i32)
                    .unwrap_or(0)
            } else {
                let scaled = last_logits.divide(&Array::from_f32(temperature))?;
                let probs = mlx_rs::ops::softmax_axis(&scaled, -1, false)?;
                sample_categorical(&probs.as_slice::<f32>().to_vec())
            };

            generated.push(next_token);

            if next_token == eos_token_id {
                break;
            }
        }

        Ok(generated[initial_len..].to_vec())
    }
}

/// Sample from a categorical distribution given normalized probabilities.
fn sample_categorical(probs: &[f32]) -> i32 {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let sample: f32 = rng.gen();

    let mut cumsum = 0.0;
    for (i, &p) in probs.iter().enumerate() {
        cumsum += p;
        if sample < cumsum {
            return i as i32;
        }
    }

    (probs.len() - 1) as i32
}

/// Only the adapter matrices are exposed as parameters. Gradients from
/// `nn::value_and_grad` therefore flow to `lora_a`/`lora_b` alone, and the
/// optimizer never sees the frozen base weights.
impl ModuleParameters for LlamaForCausalLM {
    fn num_parameters(&self) -> usize {
        self.num_adapter_params()
    }

    fn parameters(&self) -> ModuleParamRef<'_> {
        let mut params = ModuleParamRef::new();

        for (i, layer) in self.model.layers.iter().enumerate() {
            let prefix: Rc<str> = Rc::from(format!("model.layers.{}", i));
            let mut attn_params = HashMap::new();

            for (name, proj) in [
                ("q_proj", &layer.self_attn.q_proj),
                ("k_proj", &layer.self_attn.k_proj),
                ("v_proj", &layer.self_attn.v_proj),
                ("o_proj", &layer.self_attn.o_proj),
            ] {
                if let Some(adapter) = proj.adapter() {
                    let mut proj_params = HashMap::new();
                    proj_params.insert(Rc::from("lora_a"), NestedValue::Value(&adapter.lora_a));
                    proj_params.insert(Rc::from("lora_b"), NestedValue::Value(&adapter.lora_b));
                    attn_params.insert(Rc::from(name), NestedValue::Map(proj_params));
                }
            }

            let mut layer_params = HashMap::new();
            layer_params.insert(Rc::from("self_attn"), NestedValue::Map(attn_params));
            params.insert(prefix, NestedValue::Map(layer_params));
        }

        params
    }

    fn parameters_mut(&mut self) -> ModuleParamMut<'_> {
        let mut params = ModuleParamMut::new();

        for (i, layer) in self.model.layers.iter_mut().enumerate() {
            let prefix: Rc<str> = Rc::from(format!("model.layers.{}", i));
            let mut attn_params = HashMap::new();

            for (name, proj) in [
                ("q_proj", &mut layer.self_attn.q_proj),
                ("k_proj", &mut layer.self_attn.k_proj),
                ("v_proj", &mut layer.self_attn.v_proj),
                ("o_proj", &mut layer.self_attn.o_proj),
            ] {
                if let Some(adapter) = proj.adapter_mut() {
                    let mut proj_params = HashMap::new();
                    proj_params
                        .insert(Rc::from("lora_a"), NestedValue::Value(&mut adapter.lora_a));
                    proj_params
                        .insert(Rc::from("lora_b"), NestedValue::Value(&mut adapter.lora_b));
                    attn_params.insert(Rc::from(name), NestedValue::Map(proj_params));
                }
            }

            let mut layer_params = HashMap::new();
            layer_params.insert(Rc::from("self_attn"), NestedValue::Map(attn_params));
            params.insert(prefix, NestedValue::Map(layer_params));
        }

        params
    }

    fn trainable_parameters(&self) -> ModuleParamRef<'_> {
        self.parameters()
    }

    fn freeze_parameters(&mut self, _recursive: bool) {
        // Base weights are permanently frozen; adapters are always trainable
    }

    fn unfreeze_parameters(&mut self, _recursive: bool) {}

    fn all_frozen(&self) -> Option<bool> {
        Some(false)
    }

    fn any_frozen(&self) -> Option<bool> {
        Some(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_config() -> LlamaConfig {
        LlamaConfig {
            hidden_size: 16,
            intermediate_size: 32,
            num_attention_heads: 4,
            num_key_value_heads: 2,
            num_hidden_layers: 2,
            vocab_size: 64,
            rms_norm_eps: 1e-5,
            rope_theta: 10000.0,
            max_position_embeddings: 128,
            attention_bias: false,
            mlp_bias: false,
            tie_word_embeddings: false,
        }
    }

    #[test]
    fn test_forward_shapes() {
        let mut model = LlamaForCausalLM::new(tiny_config(), &LoraConfig::default()).unwrap();
        let input = Array::from_slice(&[1_i32, 5, 9, 3], &[1, 4]);

        let logits = model.forward(&input).unwrap();
        assert_eq!(logits.shape(), &[1, 4, 64]);
    }

    #[test]
    fn test_trainable_tree_holds_only_adapters() {
        let model = LlamaForCausalLM::new(tiny_config(), &LoraConfig::default()).unwrap();
        let flat = model.trainable_parameters().flatten();

        assert!(!flat.is_empty());
        for key in flat.keys() {
            let key = key.to_string();
            assert!(
                key.ends_with("lora_a") || key.ends_with("lora_b"),
                "unexpected trainable parameter: {}",
                key
            );
            assert!(
                key.contains("q_proj") || key.contains("v_proj"),
                "default targets are q_proj and v_proj, got {}",
                key
            );
        }

        // 2 layers * 2 targets * 2 matrices
        assert_eq!(flat.len(), 8);
    }

    #[test]
    fn test_adapter_round_trip() {
        let mut model = LlamaForCausalLM::new(tiny_config(), &LoraConfig::default()).unwrap();
        let saved = model.adapter_parameters();
        assert_eq!(saved.len(), 8);

        let restored = model.set_adapter_parameters(&saved);
        assert_eq!(restored, 8);
    }

    #[test]
    fn test_rms_norm_eps_comes_from_config() {
        let mut config = tiny_config();
        config.rms_norm_eps = 1e-6;
        let model = LlamaForCausalLM::new(config, &LoraConfig::default()).unwrap();

        assert!((model.model.norm.eps - 1e-6).abs() < 1e-12);
        for layer in &model.model.layers {
            assert!((layer.input_layernorm.eps - 1e-6).abs() < 1e-12);
            assert!((layer.post_attention_layernorm.eps - 1e-6).abs() < 1e-12);
        }
    }

    #[test]
    fn test_set_training_toggles_adapters() {
        let mut model = LlamaForCausalLM::new(tiny_config(), &LoraConfig::default()).unwrap();

        model.set_training(true);
        let mut seen = 0;
        for layer in &model.model.layers {
            for proj in [&layer.self_attn.q_proj, &layer.self_attn.v_proj] {
                let adapter = proj.adapter().unwrap();
                assert!(adapter.training);
                seen += 1;
            }
        }
        assert_eq!(seen, 4);

        model.set_training(false);
        for layer in &model.model.layers {
            assert!(!layer.self_attn.q_proj.adapter().unwrap().training);
        }
    }

    #[test]
    fn test_load_base_weights_installs_quantized_tensor() {
        use crate::model::quant::QuantizedTensor;

        let mut model = LlamaForCausalLM::new(tiny_config(), &LoraConfig::default()).unwrap();

        let data: Vec<f32> = (0..16 * 16).map(|i| (i as f32 - 128.0) * 0.01).collect();
        let q = QuantizedTensor::from_f32(&data, &[16, 16]).unwrap();

        let mut weights = HashMap::new();
        weights.insert(
            "model.layers.0.self_attn.q_proj.weight".to_string(),
            WeightTensor::Quantized(q),
        );

        let (loaded, missing) = model.load_base_weights(weights).unwrap();
        assert_eq!(loaded, 1);
        assert!(missing > 0);

        // The dequantized weight is live in the layer
        let input = Array::from_slice(&[1_i32, 5, 9, 3], &[1, 4]);
        let logits = model.forward(&input).unwrap();
        assert_eq!(logits.shape(), &[1, 4, 64]);
    }

    #[test]
    fn test_adapter_count_matches_config() {
        let lora = LoraConfig::default();
        let config = tiny_config();
        let model = LlamaForCausalLM::new(config.clone(), &lora).unwrap();

        let head_dim = config.hidden_size / config.num_attention_heads;
        let q_params = lora.rank * config.hidden_size as usize
            + (config.num_attention_heads * head_dim) as usize * lora.rank;
        let v_params = lora.rank * config.hidden_size as usize
            + (config.num_key_value_heads * head_dim) as usize * lora.rank;
        let expected = (q_params + v_params) * config.num_hidden_layers as usize;

        assert_eq!(model.num_adapter_params(), expected);
    }
}
