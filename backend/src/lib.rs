pub mod clinical;
pub mod config;
pub mod gradcam;
pub mod imaging;
pub mod model;
pub mod pipeline;
pub mod routes;

pub use pipeline::{AnalysisError, AnalysisRequest, AnalysisResult, Analyzer};
