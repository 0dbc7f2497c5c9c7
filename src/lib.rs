pub mod api;
pub mod commands;
pub mod models;
pub mod pipeline;
pub mod settings_layer;
pub mod storage;
pub mod worker;
