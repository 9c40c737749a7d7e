use shared::{
    AbcdeScore, FactorTag, FitzpatrickType, PatientContext, RiskAssessment, RiskFactor,
    RiskLevel,
};

use super::abcde::DIAMETER_SATURATION_MM;
use crate::model::ClassProbabilityVector;

pub const LOW_RISK_THRESHOLD: f32 = 0.3;
pub const HIGH_RISK_THRESHOLD: f32 = 0.7;

const CLASSIFIER_WEIGHT: f32 = 0.7;
const MORPHOLOGY_WEIGHT: f32 = 0.3;

const FAMILY_HISTORY_BONUS: f32 = 0.15;
const AGE_BONUS: f32 = 0.10;
const PRIOR_LESION_BONUS: f32 = 0.05;
const PRIOR_LESION_CAP: f32 = 0.15;
pub const FAIR_SKIN_BONUS: f32 = 0.05;

const OLDER_PATIENT_AGE: u32 = 60;
const YOUNGER_PATIENT_AGE: u32 = 30;

const ASYMMETRY_RISK: f32 = 0.6;
const BORDER_RISK: f32 = 0.6;
const COLOR_RISK: f32 = 0.4;
const SHAPE_FAVORABLE: f32 = 0.2;
const DIAMETER_RISK_MM: f32 = 6.0;
const MALIGNANT_MASS_RISK: f32 = 0.3;
const MALIGNANT_MASS_FAVORABLE: f32 = 0.1;

pub const UNRELIABLE_NOTICE: &str = "UNRELIABLE RESULT: no trained classifier is loaded, \
    so these probabilities are random and must not be used as a diagnosis.";

pub fn risk_level(score: f32) -> RiskLevel {
    if score < LOW_RISK_THRESHOLD {
        RiskLevel::Low
    } else if score < HIGH_RISK_THRESHOLD {
        RiskLevel::Medium
    } else {
        RiskLevel::High
    }
}

pub fn recommendation(level: RiskLevel) -> &'static str {
    match level {
        RiskLevel::Low => "Monitor lesion. Schedule routine dermatology check-up.",
        RiskLevel::Medium => "Dermatologist consultation recommended within 4 weeks.",
        RiskLevel::High => "Urgent dermatologist consultation recommended within 2 weeks.",
    }
}

fn finite_unit(value: f32) -> f32 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

fn factor(tag: FactorTag, description: impl Into<String>) -> RiskFactor {
    RiskFactor {
        tag,
        description: description.into(),
    }
}

/// Combines classifier output, morphology, skin type and patient history into one
/// assessment. Never fails: undetermined measurements are left out of the morphology
/// mean and non-finite values count as zero.
///
/// The classifier term is the probability mass on malignant classes, so with the
/// other inputs fixed the score and level never fall as that mass rises.
#[derive(Debug, Clone, Copy, Default)]
pub struct RiskFusionEngine;

impl RiskFusionEngine {
    pub fn assess(
        &self,
        probabilities: &ClassProbabilityVector,
        abcde: &AbcdeScore,
        skin_type: FitzpatrickType,
        patient: Option<&PatientContext>,
        degraded: bool,
    ) -> RiskAssessment {
        let mut risk_factors = Vec::new();
        let mut protective_factors = Vec::new();

        let classifier_score = finite_unit(probabilities.malignant_mass());
        self.classifier_factors(probabilities, &mut risk_factors, &mut protective_factors);

        let morphology = self.morphology_terms(abcde, &mut risk_factors, &mut protective_factors);
        let image_score = if morphology.is_empty() {
            classifier_score
        } else {
            let mean = morphology.iter().sum::<f32>() / morphology.len() as f32;
            CLASSIFIER_WEIGHT * classifier_score + MORPHOLOGY_WEIGHT * mean
        };

        let mut bonus = 0.0f32;
        if skin_type.is_fair() {
            bonus += FAIR_SKIN_BONUS;
            risk_factors.push(factor(
                FactorTag::SkinType,
                format!("Fair skin (Fitzpatrick {skin_type})"),
            ));
        }
        if let Some(patient) = patient {
            bonus += self.patient_terms(patient, &mut risk_factors, &mut protective_factors);
        }

        let score = (image_score + bonus).clamp(0.0, 1.0);
        let level = risk_level(score);

        let recommendation = if degraded {
            risk_factors.push(factor(
                FactorTag::DegradedModel,
                "Classifier weights unavailable; probabilities are not from a trained model",
            ));
            format!("{} {}", UNRELIABLE_NOTICE, recommendation(level))
        } else {
            recommendation(level).to_string()
        };

        log::info!("Risk assessment: {} (score: {:.2})", level, score);

        RiskAssessment {
            level,
            melanoma_risk_score: score,
            risk_factors,
            protective_factors,
            recommendation,
            reliable: !degraded,
        }
    }

    fn classifier_factors(
        &self,
        probabilities: &ClassProbabilityVector,
        risk: &mut Vec<RiskFactor>,
        protective: &mut Vec<RiskFactor>,
    ) {
        let (top, confidence) = probabilities.top1();
        if top.is_malignant() {
            risk.push(factor(
                FactorTag::TopPrediction,
                format!(
                    "Classifier top prediction: {} ({:.0}%)",
                    top.display_name(),
                    finite_unit(confidence) * 100.0
                ),
            ));
        }

        let malignant = finite_unit(probabilities.malignant_mass());
        if malignant >= MALIGNANT_MASS_RISK {
            risk.push(factor(
                FactorTag::ClassifierOutput,
                format!(
                    "Malignant classes hold {:.0}% of classifier probability",
                    malignant * 100.0
                ),
            ));
        } else if malignant < MALIGNANT_MASS_FAVORABLE {
            protective.push(factor(
                FactorTag::ClassifierOutput,
                format!(
                    "Malignant classes hold under {:.0}% of classifier probability",
                    MALIGNANT_MASS_FAVORABLE * 100.0
                ),
            ));
        }
    }

    /// Determined ABCDE components scaled to `[0, 1]`, recording factors on the way.
    fn morphology_terms(
        &self,
        abcde: &AbcdeScore,
        risk: &mut Vec<RiskFactor>,
        protective: &mut Vec<RiskFactor>,
    ) -> Vec<f32> {
        let mut terms = Vec::with_capacity(4);

        if let Some(value) = abcde.asymmetry.value().map(finite_unit) {
            terms.push(value);
            if value > ASYMMETRY_RISK {
                risk.push(factor(
                    FactorTag::Asymmetry,
                    format!("High asymmetry score ({value:.2})"),
                ));
            } else if value < SHAPE_FAVORABLE {
                protective.push(factor(FactorTag::Asymmetry, "Symmetric lesion shape"));
            }
        }

        if let Some(value) = abcde.border.value().map(finite_unit) {
            terms.push(value);
            if value > BORDER_RISK {
                risk.push(factor(
                    FactorTag::Border,
                    format!("Irregular border detected ({value:.2})"),
                ));
            } else if value < SHAPE_FAVORABLE {
                protective.push(factor(FactorTag::Border, "Regular, well-defined border"));
            }
        }

        if let Some(value) = abcde.color.value().map(finite_unit) {
            terms.push(value);
            if value >= COLOR_RISK {
                risk.push(factor(
                    FactorTag::Color,
                    format!("High color variation ({value:.2})"),
                ));
            } else if value == 0.0 {
                protective.push(factor(FactorTag::Color, "Uniform lesion color"));
            }
        }

        let diameter = abcde
            .diameter
            .millimeters()
            .filter(|mm| mm.is_finite() && *mm >= 0.0);
        if let Some(mm) = diameter {
            terms.push((mm / DIAMETER_SATURATION_MM).min(1.0));
            let qualifier = if abcde.diameter.is_estimate() { ", estimated" } else { "" };
            if mm > DIAMETER_RISK_MM {
                risk.push(factor(
                    FactorTag::Diameter,
                    format!("Lesion diameter > 6mm ({mm:.1}mm{qualifier})"),
                ));
            } else {
                protective.push(factor(
                    FactorTag::Diameter,
                    format!("Lesion diameter within 6mm ({mm:.1}mm{qualifier})"),
                ));
            }
        }

        terms
    }

    fn patient_terms(
        &self,
        patient: &PatientContext,
        risk: &mut Vec<RiskFactor>,
        protective: &mut Vec<RiskFactor>,
    ) -> f32 {
        let mut bonus = 0.0f32;

        if patient.family_history {
            bonus += FAMILY_HISTORY_BONUS;
            risk.push(factor(
                FactorTag::FamilyHistory,
                "Family history of melanoma/skin cancer",
            ));
        }

        match patient.age {
            Some(age) if age > OLDER_PATIENT_AGE => {
                bonus += AGE_BONUS;
                risk.push(factor(FactorTag::Age, format!("Age > {OLDER_PATIENT_AGE}")));
            }
            Some(age) if age < YOUNGER_PATIENT_AGE => {
                protective.push(factor(FactorTag::Age, format!("Age < {YOUNGER_PATIENT_AGE}")));
            }
            _ => {}
        }

        if patient.prior_lesion_count > 0 {
            let count = patient.prior_lesion_count as f32;
            bonus += (PRIOR_LESION_BONUS * count).min(PRIOR_LESION_CAP);
            let plural = if patient.prior_lesion_count == 1 { "" } else { "s" };
            risk.push(factor(
                FactorTag::PriorLesions,
                format!("{} prior lesion{} on record", patient.prior_lesion_count, plural),
            ));
        }

        if patient.regular_skin_checks {
            protective.push(factor(FactorTag::RegularSkinChecks, "Regular skin checks"));
        }
        if patient.smoker == Some(false) {
            protective.push(factor(FactorTag::NonSmoker, "Non-smoker"));
        }

        bonus
    }
}
