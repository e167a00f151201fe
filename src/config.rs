use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database_url: String,
    pub credentials_file: String,
    pub forward_to: String,
    pub search_query: String,
    pub label_name: String,
    pub fuzzy_threshold: u32,
    pub max_retries: u32,
    pub message_delay_ms: u64,
    pub batch_pause_ms: u64,
    pub forward_batch_size: usize,
    pub label_batch_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite:flightscan.db?mode=rwc".to_string(),
            credentials_file: "credentials.json".to_string(),
            forward_to: "plans@tripit.com".to_string(),
            search_query: "(subject:(confirmation OR itinerary) (flight OR airline)) \
                           OR \"boarding pass\" \
                           OR from:(united.com OR delta.com OR aa.com OR southwest.com OR jetblue.com) \
                           after:2000/01/01"
                .to_string(),
            label_name: "Flight Confirmations - To Review".to_string(),
            fuzzy_threshold: 95,
            max_retries: 5,
            message_delay_ms: 100,
            batch_pause_ms: 1000,
            forward_batch_size: 50,
            label_batch_size: 1000,
        }
    }
}

impl Config {
    pub fn load() -> Self {
        use std::fs;
        if let Ok(content) = fs::read_to_string("settings.toml") {
            if let Ok(config) = toml::from_str(&content) {
                return config;
            }
        }
        Self::default()
    }
}
