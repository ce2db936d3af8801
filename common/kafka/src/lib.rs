pub mod batch_consumer;
pub mod config;


pub const VIDEO_INTERACTIONS_TOPIC: &str = "video-interactions";
pub const VIDEO_EMBEDDINGS_TOPIC: &str = "video-embeddings";
