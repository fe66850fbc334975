use std::sync::Arc;

use crate::config::AppConfig;
use crate::upstream::InferenceTransport;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub transport: Arc<dyn InferenceTransport>,
}

impl AppState {
    pub fn new(config: AppConfig, transport: Arc<dyn InferenceTransport>) -> Self {
        Self {
            config: Arc::new(config),
            transport,
        }
    }
}
