pub mod gateway;

pub use gateway::{GatewayClient, GatewayConfig, LlmError, LlmMessage};
