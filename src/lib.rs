// src/lib.rs
pub mod ports {
    pub mod market_data;
    pub mod replay_feed;
    pub mod state_store;
    pub mod yahoo_feed;
}
pub mod alert_notifier;
pub mod config;
pub mod pairtrade;
pub mod status;
pub mod trade;
