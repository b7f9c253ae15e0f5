//! Llama-2 inference on portable GPU compute shaders.
//!
//! Runs a float32 llama2 checkpoint through a pipeline of WGSL compute
//! kernels: matmul, RMSNorm, rotary embeddings, multi-head attention over an
//! incrementally grown KV cache, SwiGLU, and log-depth pairwise reductions
//! for every sum/max/argmax/softmax the forward pass needs.

pub mod config;
pub mod gpu;
pub mod kernels;
pub mod logging;
pub mod model;
pub mod ops;
pub mod reduce;
pub mod sampler;
pub mod state;
pub mod tokenizer;
pub mod weights;

pub use config::Config;
pub use model::{GenerationStats, Transformer};
pub use sampler::{SamplingParams, TokenRng};
pub use tokenizer::Tokenizer;
