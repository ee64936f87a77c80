pub mod audio_models;
pub mod config;
pub mod error;
pub mod hal;
pub mod recording_result;
pub mod state;
pub mod stream;
pub mod target;
pub mod upload;
