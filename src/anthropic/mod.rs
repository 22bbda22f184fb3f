pub mod client;
pub mod error;
pub mod provider;
pub mod types;

pub use client::{AnthropicClient, MessageSender};
pub use error::AnthropicError;
pub use provider::{AnthropicProvider, AnthropicProviderConfig};
pub use types::{ContentBlock, Message, MessagesRequest, MessagesResponse, Usage};
