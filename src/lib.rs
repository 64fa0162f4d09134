#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(unused_variables)]

pub mod config;
pub mod decoder;
pub mod error;
pub mod muzero;
pub mod tokenizer;
pub mod training;
pub mod transformer;

pub use error::ZeroError;
pub use muzero::{MuZeroNetwork, NetworkOutput, SelfiesZeroConfig, SelfiesZeroModel};
pub use tokenizer::SelfiesTokenizer;
