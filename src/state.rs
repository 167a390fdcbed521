use redis::aio::ConnectionManager;

use crate::config::Config;
use crate::providers::ProviderRegistry;
use crate::services::settlement::UsageQueue;

#[derive(Clone)]
pub struct AppState {
    pub redis: ConnectionManager,
    pub config: Config,
    pub http_client: reqwest::Client,
    pub providers: ProviderRegistry,
    pub usage_queue: UsageQueue,
}
