mod tensorzero;

pub use tensorzero::{InferenceOptions, LlmClient, LlmConfig, LlmError};
