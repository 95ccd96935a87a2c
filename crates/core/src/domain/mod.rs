pub mod error;
pub mod job;
pub mod settings;
pub mod transcribe;
pub mod types;
