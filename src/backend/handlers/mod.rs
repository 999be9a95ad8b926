mod chat;
mod health;
mod models;

pub use chat::chat_stream_handler;
pub use health::health_handler;
pub use models::{models_handler, set_model_handler};
