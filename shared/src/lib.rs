use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, EnumIter, EnumString};
use uuid::Uuid;

/// The closed set of lesion classes a loaded classifier scores, in output order.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    EnumIter,
    EnumString,
    AsRefStr,
    strum_macros::Display,
)]
#[strum(ascii_case_insensitive)]
pub enum LesionClass {
    #[serde(rename = "AK")]
    #[strum(serialize = "AK")]
    ActinicKeratosis,
    #[serde(rename = "BCC")]
    #[strum(serialize = "BCC")]
    BasalCellCarcinoma,
    #[serde(rename = "BKL")]
    #[strum(serialize = "BKL")]
    BenignKeratosis,
    #[serde(rename = "DF")]
    #[strum(serialize = "DF")]
    Dermatofibroma,
    #[serde(rename = "MEL")]
    #[strum(serialize = "MEL")]
    Melanoma,
    #[serde(rename = "NV")]
    #[strum(serialize = "NV")]
    MelanocyticNevus,
    #[serde(rename = "SCC")]
    #[strum(serialize = "SCC")]
    SquamousCellCarcinoma,
    #[serde(rename = "VASC")]
    #[strum(serialize = "VASC")]
    VascularLesion,
}

pub const CLASS_COUNT: usize = 8;

impl LesionClass {
    pub const ALL: [LesionClass; CLASS_COUNT] = [
        LesionClass::ActinicKeratosis,
        LesionClass::BasalCellCarcinoma,
        LesionClass::BenignKeratosis,
        LesionClass::Dermatofibroma,
        LesionClass::Melanoma,
        LesionClass::MelanocyticNevus,
        LesionClass::SquamousCellCarcinoma,
        LesionClass::VascularLesion,
    ];

    /// Position of the class in every probability vector.
    pub fn index(self) -> usize {
        match self {
            LesionClass::ActinicKeratosis => 0,
            LesionClass::BasalCellCarcinoma => 1,
            LesionClass::BenignKeratosis => 2,
            LesionClass::Dermatofibroma => 3,
            LesionClass::Melanoma => 4,
            LesionClass::MelanocyticNevus => 5,
            LesionClass::SquamousCellCarcinoma => 6,
            LesionClass::VascularLesion => 7,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn code(self) -> &'static str {
        match self {
            LesionClass::ActinicKeratosis => "AK",
            LesionClass::BasalCellCarcinoma => "BCC",
            LesionClass::BenignKeratosis => "BKL",
            LesionClass::Dermatofibroma => "DF",
            LesionClass::Melanoma => "MEL",
            LesionClass::MelanocyticNevus => "NV",
            LesionClass::SquamousCellCarcinoma => "SCC",
            LesionClass::VascularLesion => "VASC",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            LesionClass::ActinicKeratosis => "Actinic Keratosis",
            LesionClass::BasalCellCarcinoma => "Basal Cell Carcinoma",
            LesionClass::BenignKeratosis => "Benign Keratosis",
            LesionClass::Dermatofibroma => "Dermatofibroma",
            LesionClass::Melanoma => "Melanoma",
            LesionClass::MelanocyticNevus => "Melanocytic Nevus",
            LesionClass::SquamousCellCarcinoma => "Squamous Cell Carcinoma",
            LesionClass::VascularLesion => "Vascular Lesion",
        }
    }

    pub fn is_malignant(self) -> bool {
        matches!(
            self,
            LesionClass::Melanoma
                | LesionClass::BasalCellCarcinoma
                | LesionClass::SquamousCellCarcinoma
        )
    }
}

/// Fitzpatrick skin phototype, ordered from lightest (I) to darkest (VI).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
pub enum FitzpatrickType {
    #[display(fmt = "Type I")]
    I,
    #[display(fmt = "Type II")]
    II,
    #[display(fmt = "Type III")]
    III,
    #[display(fmt = "Type IV")]
    IV,
    #[display(fmt = "Type V")]
    V,
    #[display(fmt = "Type VI")]
    VI,
}

impl FitzpatrickType {
    pub fn description(self) -> &'static str {
        match self {
            FitzpatrickType::I => "Pale white skin, always burns, never tans",
            FitzpatrickType::II => "White skin, burns easily, tans minimally",
            FitzpatrickType::III => "Light brown skin, burns moderately, tans gradually",
            FitzpatrickType::IV => "Moderate brown skin, burns minimally, tans well",
            FitzpatrickType::V => "Dark brown skin, rarely burns, tans profusely",
            FitzpatrickType::VI => "Deeply pigmented dark brown to black, never burns",
        }
    }

    pub fn is_fair(self) -> bool {
        matches!(self, FitzpatrickType::I | FitzpatrickType::II)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    #[display(fmt = "low")]
    Low,
    #[display(fmt = "medium")]
    Medium,
    #[display(fmt = "high")]
    High,
}

/// A scalar ABCDE reading. Missing data is its own state, never a zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Measurement {
    Determined { value: f32 },
    Undetermined { reason: String },
}

impl Measurement {
    pub fn determined(value: f32) -> Self {
        Measurement::Determined { value }
    }

    pub fn undetermined(reason: impl Into<String>) -> Self {
        Measurement::Undetermined {
            reason: reason.into(),
        }
    }

    pub fn value(&self) -> Option<f32> {
        match self {
            Measurement::Determined { value } => Some(*value),
            Measurement::Undetermined { .. } => None,
        }
    }

    pub fn is_determined(&self) -> bool {
        self.value().is_some()
    }
}

/// Lesion diameter. `Estimated` means the default calibration was assumed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Diameter {
    Calibrated {
        millimeters: f32,
        source_pixels: f32,
        mm_per_pixel: f32,
    },
    Estimated {
        millimeters: f32,
        source_pixels: f32,
        assumed_mm_per_pixel: f32,
    },
    Undetermined {
        reason: String,
    },
}

impl Diameter {
    pub fn millimeters(&self) -> Option<f32> {
        match self {
            Diameter::Calibrated { millimeters, .. } | Diameter::Estimated { millimeters, .. } => {
                Some(*millimeters)
            }
            Diameter::Undetermined { .. } => None,
        }
    }

    pub fn is_estimate(&self) -> bool {
        matches!(self, Diameter::Estimated { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbcdeScore {
    pub asymmetry: Measurement,
    pub border: Measurement,
    pub color: Measurement,
    pub diameter: Diameter,
    pub evolution: Measurement,
}

impl AbcdeScore {
    pub fn undetermined(reason: &str) -> Self {
        Self {
            asymmetry: Measurement::undetermined(reason),
            border: Measurement::undetermined(reason),
            color: Measurement::undetermined(reason),
            diameter: Diameter::Undetermined {
                reason: reason.to_string(),
            },
            evolution: Measurement::undetermined(EVOLUTION_REASON),
        }
    }

    pub fn is_fully_undetermined(&self) -> bool {
        !self.asymmetry.is_determined()
            && !self.border.is_determined()
            && !self.color.is_determined()
            && self.diameter.millimeters().is_none()
    }
}

pub const EVOLUTION_REASON: &str = "evolution requires prior images of the same lesion";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkinToneReading {
    pub fitzpatrick: FitzpatrickType,
    pub description: String,
    pub ita_degrees: f32,
    pub median_rgb: [u8; 3],
    pub sampled_pixels: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactorTag {
    ClassifierOutput,
    TopPrediction,
    Asymmetry,
    Border,
    Color,
    Diameter,
    FamilyHistory,
    Age,
    PriorLesions,
    SkinType,
    RegularSkinChecks,
    NonSmoker,
    DegradedModel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskFactor {
    pub tag: FactorTag,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub level: RiskLevel,
    pub melanoma_risk_score: f32,
    pub risk_factors: Vec<RiskFactor>,
    pub protective_factors: Vec<RiskFactor>,
    pub recommendation: String,
    pub reliable: bool,
}

impl RiskAssessment {
    pub fn has_risk_factor(&self, tag: FactorTag) -> bool {
        self.risk_factors.iter().any(|f| f.tag == tag)
    }

    pub fn has_protective_factor(&self, tag: FactorTag) -> bool {
        self.protective_factors.iter().any(|f| f.tag == tag)
    }
}

/// Optional patient record supplied by the persistence layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatientContext {
    pub age: Option<u32>,
    #[serde(default)]
    pub family_history: bool,
    #[serde(default)]
    pub prior_lesion_count: u32,
    #[serde(default)]
    pub regular_skin_checks: bool,
    pub smoker: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassProbability {
    pub class: LesionClass,
    pub name: String,
    pub probability: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationSummary {
    pub primary: ClassProbability,
    pub ranked: Vec<ClassProbability>,
    pub malignant_probability: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttentionSummary {
    pub target_class: LesionClass,
    /// Peak attention as `[x, y]` in normalized-image pixels.
    pub hotspot: [u32; 2],
    /// Share of attention mass falling on the lesion mask, when one was derived.
    pub lesion_focus: Option<f32>,
    pub grid: Vec<Vec<f32>>,
    pub overlay_png_base64: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResponse {
    pub analysis_id: Uuid,
    pub analyzed_at: DateTime<Utc>,
    pub image_sha256: String,
    pub source_dimensions: [u32; 2],
    pub degraded: bool,
    pub classification: ClassificationSummary,
    pub attention: AttentionSummary,
    pub abcde: AbcdeScore,
    pub skin_tone: SkinToneReading,
    pub risk_assessment: RiskAssessment,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    pub backend: String,
    pub classes: Vec<LesionClass>,
    pub degraded: bool,
    pub weights_sha256: Option<String>,
}
