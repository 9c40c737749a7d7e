use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use image::RgbImage;
use shared::{
    AbcdeScore, AnalysisResponse, AttentionSummary, ClassificationSummary, LesionClass,
    PatientContext, RiskAssessment, SkinToneReading,
};
use uuid::Uuid;

use crate::clinical::{
    LesionMask, MaskUnavailable, MorphologyAnalyzer, RiskFusionEngine, SegmentationSettings,
    classify_skin_tone, derive_lesion_mask,
};
use crate::config::AppConfig;
use crate::gradcam::{self, AttentionMap};
use crate::imaging::{ImageValidator, InvalidImageError, overlay};
use crate::model::{ClassProbabilityVector, InferenceError, Model};

#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    #[error(transparent)]
    InvalidImage(#[from] InvalidImageError),
    #[error(transparent)]
    Inference(#[from] InferenceError),
}

impl AnalysisError {
    pub fn kind(&self) -> &'static str {
        match self {
            AnalysisError::InvalidImage(_) => "invalid_image",
            AnalysisError::Inference(_) => "inference",
        }
    }
}

/// One photograph to analyze. `mm_per_pixel` is millimetres per source-image pixel.
/// A supplied `mask` replaces segmentation and must lie on the normalized grid.
#[derive(Debug, Clone)]
pub struct AnalysisRequest<'a> {
    pub image_data: &'a [u8],
    pub content_type: &'a str,
    pub mm_per_pixel: Option<f32>,
    pub patient: Option<PatientContext>,
    pub target_class: Option<LesionClass>,
    pub mask: Option<LesionMask>,
}

impl<'a> AnalysisRequest<'a> {
    pub fn new(image_data: &'a [u8], content_type: &'a str) -> Self {
        Self {
            image_data,
            content_type,
            mm_per_pixel: None,
            patient: None,
            target_class: None,
            mask: None,
        }
    }

    pub fn with_calibration(mut self, mm_per_pixel: f32) -> Self {
        self.mm_per_pixel = Some(mm_per_pixel);
        self
    }

    pub fn with_patient(mut self, patient: PatientContext) -> Self {
        self.patient = Some(patient);
        self
    }

    pub fn with_target(mut self, target: LesionClass) -> Self {
        self.target_class = Some(target);
        self
    }

    pub fn with_mask(mut self, mask: LesionMask) -> Self {
        self.mask = Some(mask);
        self
    }
}

#[derive(Debug, Clone)]
pub struct AnalysisResult {
    pub analysis_id: Uuid,
    pub analyzed_at: DateTime<Utc>,
    pub image_sha256: String,
    pub source_dimensions: (u32, u32),
    pub degraded: bool,
    pub probabilities: ClassProbabilityVector,
    pub attention: AttentionMap,
    pub lesion_focus: Option<f32>,
    pub overlay: RgbImage,
    pub abcde: AbcdeScore,
    pub skin_tone: SkinToneReading,
    pub risk: RiskAssessment,
}

impl AnalysisResult {
    pub fn overlay_png(&self) -> Result<Vec<u8>, image::ImageError> {
        overlay::encode_png(&self.overlay)
    }

    pub fn to_response(&self, include_overlay: bool) -> AnalysisResponse {
        let overlay_png_base64 = if include_overlay {
            match self.overlay_png() {
                Ok(bytes) => Some(STANDARD.encode(bytes)),
                Err(e) => {
                    log::error!("Failed to encode attention overlay: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let ranked = self.probabilities.ranked();
        let (hotspot_x, hotspot_y) = self.attention.hotspot();
        AnalysisResponse {
            analysis_id: self.analysis_id,
            analyzed_at: self.analyzed_at,
            image_sha256: self.image_sha256.clone(),
            source_dimensions: [self.source_dimensions.0, self.source_dimensions.1],
            degraded: self.degraded,
            classification: ClassificationSummary {
                primary: ranked[0].clone(),
                malignant_probability: self.probabilities.malignant_mass(),
                ranked,
            },
            attention: AttentionSummary {
                target_class: self.attention.target(),
                hotspot: [hotspot_x, hotspot_y],
                lesion_focus: self.lesion_focus,
                grid: self.attention.grid_rows(),
                overlay_png_base64,
            },
            abcde: self.abcde.clone(),
            skin_tone: self.skin_tone.clone(),
            risk_assessment: self.risk.clone(),
        }
    }
}

/// Runs validation, classification, explanation, morphology, skin tone and risk
/// fusion for one image. Holds no per-request state.
#[derive(Debug, Clone)]
pub struct Analyzer {
    model: Model,
    validator: ImageValidator,
    segmentation: SegmentationSettings,
    morphology: MorphologyAnalyzer,
    risk: RiskFusionEngine,
    overlay_alpha: f32,
}

impl Analyzer {
    pub fn new(model: Model, config: &AppConfig) -> Self {
        Self {
            model,
            validator: ImageValidator::new(config.image.clone(), config.server.max_upload_bytes),
            segmentation: SegmentationSettings::default(),
            morphology: MorphologyAnalyzer::new(config.analysis.default_mm_per_pixel),
            risk: RiskFusionEngine,
            overlay_alpha: config.analysis.overlay_alpha,
        }
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.validator.max_bytes()
    }

    pub fn analyze(&self, request: AnalysisRequest<'_>) -> Result<AnalysisResult, AnalysisError> {
        let image = self.validator.validate(request.image_data, request.content_type)?;
        let probabilities = self.model.inference(&image)?;
        let (top, confidence) = probabilities.top1();
        log::info!(
            "Classified image {} as {} ({:.1}%)",
            &image.digest()[..12],
            top,
            confidence * 100.0
        );

        let grid = (image.width(), image.height());
        let mask = match request.mask {
            Some(mask) if mask.dimensions() == grid => Ok(mask),
            Some(mask) => Err(MaskUnavailable::DimensionMismatch {
                mask: mask.dimensions(),
                image: grid,
            }),
            None => derive_lesion_mask(&image, &self.segmentation),
        };
        if let Err(reason) = &mask {
            log::warn!("Lesion mask unavailable: {}", reason);
        }

        let target = request.target_class.unwrap_or(top);
        let (attention, (abcde, skin_tone)) = rayon::join(
            || gradcam::explain(&self.model, &image, Some(target)),
            || {
                rayon::join(
                    || self.morphology.analyze(&image, mask.as_ref(), request.mm_per_pixel),
                    || classify_skin_tone(&image, mask.as_ref().ok()),
                )
            },
        );
        let attention = attention?;
        let lesion_focus = mask
            .as_ref()
            .ok()
            .and_then(|m| attention.lesion_focus(m));
        let overlay = attention.render_overlay(&image, self.overlay_alpha);

        let risk = self.risk.assess(
            &probabilities,
            &abcde,
            skin_tone.fitzpatrick,
            request.patient.as_ref(),
            self.model.is_degraded(),
        );

        Ok(AnalysisResult {
            analysis_id: Uuid::new_v4(),
            analyzed_at: Utc::now(),
            image_sha256: image.digest().to_string(),
            source_dimensions: image.source_dimensions(),
            degraded: self.model.is_degraded(),
            probabilities,
            attention,
            lesion_focus,
            overlay,
            abcde,
            skin_tone,
            risk,
        })
    }
}
