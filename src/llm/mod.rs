pub mod adapter;
#[cfg(feature = "gemini")]
pub mod client;
pub mod extractor;
pub mod prompts;
pub mod types;
pub mod validation;

pub use adapter::*;
#[cfg(feature = "gemini")]
pub use client::*;
pub use extractor::*;
pub use types::*;
pub use validation::{OutputValidator, ValidationError};
