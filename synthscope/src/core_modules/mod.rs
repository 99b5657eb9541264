pub mod classifier;
pub mod detector;
pub mod detectors;
pub mod extractor;
pub mod feature_store;
pub mod feature_vector;
pub mod feedback_store;
pub mod label;
pub mod manifest;
pub mod model_manager;
pub mod orchestrator;
pub mod preprocessor;
pub mod retrainer;
pub mod training_data;
pub mod utils;
