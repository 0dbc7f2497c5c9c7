pub mod error;
pub mod handler_utils;
pub mod messages;
pub mod queue;
pub mod server;
