pub mod key_service;
pub mod model_service;
pub mod settlement;
pub mod stream_tracker;
pub mod usage_service;
