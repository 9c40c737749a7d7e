pub mod overlay;
pub mod preprocess;

pub use preprocess::{ImageValidator, InvalidImageError, NormalizedImage, calculate_image_hash};
