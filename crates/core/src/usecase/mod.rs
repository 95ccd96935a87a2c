pub mod batch_service;
pub mod file_pipeline;
pub mod worker_pool;
