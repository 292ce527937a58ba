pub mod schema;

pub use schema::{AgentConfig, ChannelsConfig, Config, LimitsConfig, SlackConfig, TelegramConfig};
