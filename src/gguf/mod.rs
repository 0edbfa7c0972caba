//! GGUF (GPT-Generated Unified Format) reader
//!
//! Pure Rust reader for the GGUF v3 container used by llama.cpp-compatible
//! tools. Used to load the target model into memory and to memory-map an
//! optional higher-precision base model.
//!
//! Format specification: <https://github.com/ggerganov/ggml/blob/master/docs/gguf.md>

mod io;
mod loader;
mod model;
pub mod test_factory;
mod types;

pub use model::MappedGGUFModel;
pub use test_factory::GGUFBuilder;
pub use types::*;
