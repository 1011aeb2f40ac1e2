pub mod llama;
pub mod loader;
pub mod lora;
pub mod quant;
pub mod tokenizer;

pub use llama::{LlamaConfig, LlamaForCausalLM};
pub use loader::{ModelLoader, WeightTensor};
pub use lora::{LoraConfig, LoraLinear};
pub use tokenizer::TokenizerWrapper;
