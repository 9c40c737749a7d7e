use std::io::Cursor;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use derm_backend::clinical::LesionMask;
use derm_backend::clinical::risk::FAIR_SKIN_BONUS;
use derm_backend::config::{AppConfig, ModelConfig};
use derm_backend::imaging::InvalidImageError;
use derm_backend::model::Model;
use derm_backend::model::native::NativeClassifier;
use derm_backend::{AnalysisError, AnalysisRequest, Analyzer};
use image::{ImageFormat, Rgb, RgbImage};
use shared::{Diameter, FactorTag, LesionClass, PatientContext};

fn png(img: &RgbImage) -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Png).unwrap();
    buf.into_inner()
}

fn lesion_png() -> Vec<u8> {
    let mut img = RgbImage::from_pixel(320, 280, Rgb([226, 192, 168]));
    for (x, y, px) in img.enumerate_pixels_mut() {
        let dx = x as f32 - 150.0;
        let dy = (y as f32 - 140.0) * 1.3;
        if dx * dx + dy * dy <= 60.0 * 60.0 {
            *px = if x < 150 { Rgb([92, 54, 38]) } else { Rgb([60, 35, 28]) };
        }
    }
    png(&img)
}

fn seeded_analyzer(seed: u64) -> Analyzer {
    let model = Model::new(Arc::new(NativeClassifier::random(seed)));
    Analyzer::new(model, &AppConfig::default())
}

#[test]
fn uniform_image_yields_undetermined_morphology() {
    let analyzer = seeded_analyzer(3);
    let data = png(&RgbImage::from_pixel(224, 224, Rgb([128, 128, 128])));

    let result = analyzer
        .analyze(AnalysisRequest::new(&data, "image/png"))
        .unwrap();

    assert!(result.abcde.is_fully_undetermined());
    assert!(matches!(result.abcde.diameter, Diameter::Undetermined { .. }));
    assert!(result.lesion_focus.is_none());

    // Only the classifier term and the skin-type bonus remain.
    let bonus = if result.skin_tone.fitzpatrick.is_fair() {
        FAIR_SKIN_BONUS
    } else {
        0.0
    };
    let expected = (result.probabilities.malignant_mass() + bonus).min(1.0);
    assert!((result.risk.melanoma_risk_score - expected).abs() < 1e-6);
    assert!(result.risk.reliable);
    assert!(!result.degraded);
}

#[test]
fn missing_weights_run_degraded_and_say_so() {
    let config = ModelConfig {
        weights_path: "/nonexistent/derm/weights.json".into(),
        degraded_seed: Some(11),
        ..ModelConfig::default()
    };
    let model = Model::load(&config).unwrap();
    assert!(model.is_degraded());

    let analyzer = Analyzer::new(model, &AppConfig::default());
    let data = lesion_png();
    let result = analyzer
        .analyze(AnalysisRequest::new(&data, "image/png"))
        .unwrap();

    assert!(result.degraded);
    assert!(!result.risk.reliable);
    assert!(result.risk.has_risk_factor(FactorTag::DegradedModel));
    assert!(result.risk.recommendation.to_lowercase().contains("unreliable"));
    assert!(result.to_response(false).degraded);
}

#[test]
fn repeated_analysis_is_deterministic() {
    let analyzer = seeded_analyzer(21);
    let data = lesion_png();

    let first = analyzer
        .analyze(AnalysisRequest::new(&data, "image/png"))
        .unwrap();
    let second = analyzer
        .analyze(AnalysisRequest::new(&data, "image/png"))
        .unwrap();

    assert_eq!(first.probabilities, second.probabilities);
    assert_eq!(first.abcde, second.abcde);
    assert_eq!(first.risk, second.risk);
    assert_eq!(first.attention.grid(), second.attention.grid());
    assert_eq!(first.image_sha256, second.image_sha256);
    assert_ne!(first.analysis_id, second.analysis_id);
}

#[test]
fn lesion_image_gets_measured() {
    let analyzer = seeded_analyzer(4);
    let data = lesion_png();

    let result = analyzer
        .analyze(AnalysisRequest::new(&data, "image/png").with_calibration(0.05))
        .unwrap();

    assert_eq!(result.source_dimensions, (320, 280));
    assert!(result.abcde.asymmetry.is_determined());
    assert!(result.abcde.border.is_determined());
    assert!(result.abcde.color.is_determined());
    match result.abcde.diameter {
        Diameter::Calibrated { millimeters, .. } => {
            // Horizontal extent is 120 source pixels.
            assert!((millimeters - 6.0).abs() < 0.6, "{millimeters}");
        }
        other => panic!("expected calibrated diameter, got {other:?}"),
    }
    assert!(!result.abcde.evolution.is_determined());
    let focus = result.lesion_focus.unwrap();
    assert!((0.0..=1.0).contains(&focus));
}

#[test]
fn tiny_image_is_rejected() {
    let analyzer = seeded_analyzer(1);
    let data = png(&RgbImage::from_pixel(10, 10, Rgb([200, 160, 140])));

    let err = analyzer
        .analyze(AnalysisRequest::new(&data, "image/png"))
        .unwrap_err();
    assert!(matches!(
        err,
        AnalysisError::InvalidImage(InvalidImageError::TooSmall { .. })
    ));
    assert_eq!(err.kind(), "invalid_image");
}

#[test]
fn non_image_payload_is_rejected() {
    let analyzer = seeded_analyzer(1);
    let err = analyzer
        .analyze(AnalysisRequest::new(b"definitely not a png", "image/png"))
        .unwrap_err();
    assert!(matches!(err, AnalysisError::InvalidImage(_)));
}

#[test]
fn weights_artifact_round_trips_through_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("weights.json");
    let weights = NativeClassifier::random(8).to_weights();
    std::fs::write(&path, serde_json::to_vec(&weights).unwrap()).unwrap();

    let config = ModelConfig {
        weights_path: path,
        ..ModelConfig::default()
    };
    let loaded = Model::load(&config).unwrap();
    assert!(!loaded.is_degraded());
    let info = loaded.info();
    assert_eq!(info.backend, "native");
    assert_eq!(info.weights_sha256.as_deref().map(str::len), Some(64));

    let data = lesion_png();
    let from_disk = Analyzer::new(loaded, &AppConfig::default())
        .analyze(AnalysisRequest::new(&data, "image/png"))
        .unwrap();
    let in_memory = seeded_analyzer(8)
        .analyze(AnalysisRequest::new(&data, "image/png"))
        .unwrap();
    assert_eq!(from_disk.probabilities, in_memory.probabilities);
}

#[test]
fn family_history_raises_risk() {
    let analyzer = seeded_analyzer(17);
    let data = lesion_png();

    let baseline = analyzer
        .analyze(AnalysisRequest::new(&data, "image/png"))
        .unwrap();
    let patient = PatientContext {
        family_history: true,
        ..PatientContext::default()
    };
    let with_history = analyzer
        .analyze(AnalysisRequest::new(&data, "image/png").with_patient(patient))
        .unwrap();

    assert!(with_history.risk.melanoma_risk_score > baseline.risk.melanoma_risk_score);
    assert!(with_history.risk.has_risk_factor(FactorTag::FamilyHistory));
}

#[test]
fn response_carries_overlay_on_request() {
    let analyzer = seeded_analyzer(2);
    let data = lesion_png();
    let result = analyzer
        .analyze(AnalysisRequest::new(&data, "image/png"))
        .unwrap();

    let without = result.to_response(false);
    assert!(without.attention.overlay_png_base64.is_none());
    assert_eq!(without.classification.ranked.len(), 8);
    assert_eq!(without.classification.primary, without.classification.ranked[0]);

    let with = result.to_response(true);
    let encoded = with.attention.overlay_png_base64.clone().unwrap();
    assert!(encoded.starts_with("iVBORw0KGgo"));

    let decoded = image::load_from_memory(&STANDARD.decode(encoded).unwrap()).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (320, 280));

    let json = serde_json::to_value(&with).unwrap();
    assert!(json["risk_assessment"]["recommendation"].is_string());
}

#[test]
fn supplied_mask_replaces_segmentation() {
    let analyzer = seeded_analyzer(5);
    let data = png(&RgbImage::from_pixel(224, 224, Rgb([128, 128, 128])));
    let mask = LesionMask::from_fn(224, 224, |x, y| {
        let dx = x as i64 - 112;
        let dy = y as i64 - 112;
        dx * dx + dy * dy <= 30 * 30
    });

    let result = analyzer
        .analyze(AnalysisRequest::new(&data, "image/png").with_mask(mask))
        .unwrap();
    assert!(result.abcde.asymmetry.is_determined());
    assert!(result.abcde.diameter.is_estimate());

    let misplaced = LesionMask::from_fn(100, 100, |_, _| true);
    let result = analyzer
        .analyze(AnalysisRequest::new(&data, "image/png").with_mask(misplaced))
        .unwrap();
    assert!(result.abcde.is_fully_undetermined());
}

#[test]
fn concurrent_analyses_match_sequential_runs() {
    let analyzer = seeded_analyzer(29);
    let data = lesion_png();
    let targets = [
        None,
        Some(LesionClass::Melanoma),
        Some(LesionClass::MelanocyticNevus),
        Some(LesionClass::BasalCellCarcinoma),
        None,
        Some(LesionClass::VascularLesion),
        Some(LesionClass::Melanoma),
        Some(LesionClass::Dermatofibroma),
    ];
    let request = |target: Option<LesionClass>| {
        let request = AnalysisRequest::new(&data, "image/png");
        match target {
            Some(class) => request.with_target(class),
            None => request,
        }
    };

    let sequential: Vec<_> = targets
        .iter()
        .map(|target| analyzer.analyze(request(*target)).unwrap())
        .collect();

    let concurrent: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = targets
            .iter()
            .map(|target| {
                let analyzer = &analyzer;
                let request = &request;
                scope.spawn(move || analyzer.analyze(request(*target)).unwrap())
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for (expected, actual) in sequential.iter().zip(&concurrent) {
        assert_eq!(expected.probabilities, actual.probabilities);
        assert_eq!(expected.abcde, actual.abcde);
        assert_eq!(expected.attention.target(), actual.attention.target());
        assert_eq!(expected.attention.grid(), actual.attention.grid());
        assert_eq!(expected.risk, actual.risk);
    }
}
