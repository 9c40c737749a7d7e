pub mod abcde;
pub mod risk;
pub mod segmentation;
pub mod skin_tone;

pub use abcde::MorphologyAnalyzer;
pub use risk::RiskFusionEngine;
pub use segmentation::{LesionMask, MaskUnavailable, SegmentationSettings, derive_lesion_mask};
pub use skin_tone::classify_skin_tone;
