pub mod augmentation;
pub mod blocks;
pub mod efficientnet;
pub mod inference;
pub mod ml_model;
pub mod mobilenet;
#[cfg(feature = "pretrained")]
pub mod pretrained;
pub mod preprocess;
pub mod training;

pub use augmentation::ImageAugmenter;
pub use inference::{load_classifier, rank_predictions, Classify, InferenceEngine};
pub use ml_model::{FeatureExtractor, LesionClassifier, ModelConfig};
pub use preprocess::{decode_rgb, preprocess_image, preprocess_rgb, PreprocessedImage};
pub use training::{train_model, write_dummy_model, LesionDataset, TrainingReport};
