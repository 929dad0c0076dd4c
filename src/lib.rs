pub mod csv_loader;
pub mod dataset;
pub mod ml;
pub mod model;
pub mod types;
pub mod web;

pub use ml::{load_classifier, Classify, InferenceEngine, PreprocessedImage};
pub use model::AppConfig;
pub use types::{Backbone, RankedLabel};
