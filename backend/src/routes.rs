use actix_multipart::{Field, Multipart};
use actix_web::http::StatusCode;
use actix_web::{Error, HttpResponse, ResponseError, web};
use futures::{StreamExt, TryStreamExt};
use serde::Serialize;
use serde_json::json;
use shared::{LesionClass, PatientContext};
use std::str::FromStr;

use crate::imaging::InvalidImageError;
use crate::pipeline::{AnalysisError, AnalysisRequest, Analyzer};

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    kind: &'static str,
}

impl ResponseError for AnalysisError {
    fn status_code(&self) -> StatusCode {
        match self {
            AnalysisError::InvalidImage(InvalidImageError::TooLarge { .. }) => {
                StatusCode::PAYLOAD_TOO_LARGE
            }
            AnalysisError::InvalidImage(_) => StatusCode::BAD_REQUEST,
            AnalysisError::Inference(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(ErrorResponse {
            error: self.to_string(),
            kind: self.kind(),
        })
    }
}

/// Problems with the form itself rather than with the image.
#[derive(Debug, thiserror::Error)]
pub enum FormError {
    #[error("Missing multipart field `image`")]
    MissingImage,
    #[error("Invalid value for `{field}`: {value}")]
    InvalidField { field: String, value: String },
    #[error("Field `{0}` exceeds the upload limit")]
    FieldTooLarge(String),
}

impl ResponseError for FormError {
    fn status_code(&self) -> StatusCode {
        match self {
            FormError::FieldTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(ErrorResponse {
            error: self.to_string(),
            kind: "invalid_request",
        })
    }
}

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/api/analyze").route(web::post().to(handle_analyze)))
        .service(web::resource("/api/health").route(web::get().to(health)))
        .service(web::resource("/api/model").route(web::get().to(model_info)));
}

const TEXT_FIELD_LIMIT: usize = 256;

#[derive(Default)]
struct AnalyzeForm {
    image: Option<(Vec<u8>, String)>,
    mm_per_pixel: Option<f32>,
    patient: PatientContext,
    has_patient: bool,
    target_class: Option<LesionClass>,
    include_overlay: bool,
}

enum FieldData {
    Complete(Vec<u8>),
    Overflow { received: usize },
}

async fn read_field(field: &mut Field, limit: usize) -> Result<FieldData, Error> {
    let mut data = Vec::new();
    while let Some(chunk) = field.next().await {
        let chunk = chunk?;
        if data.len() + chunk.len() > limit {
            return Ok(FieldData::Overflow {
                received: data.len() + chunk.len(),
            });
        }
        data.extend_from_slice(&chunk);
    }
    Ok(FieldData::Complete(data))
}

fn parse<T: FromStr>(field: &str, raw: &str) -> Result<T, FormError> {
    raw.trim().parse().map_err(|_| FormError::InvalidField {
        field: field.to_string(),
        value: raw.to_string(),
    })
}

fn parse_flag(field: &str, raw: &str) -> Result<bool, FormError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(FormError::InvalidField {
            field: field.to_string(),
            value: raw.to_string(),
        }),
    }
}

async fn read_form(payload: &mut Multipart, max_image_bytes: usize) -> Result<AnalyzeForm, Error> {
    let mut form = AnalyzeForm::default();

    while let Some(mut field) = payload.try_next().await? {
        let name = field.name().unwrap_or_default().to_string();
        if name == "image" {
            let content_type = field
                .content_type()
                .map(|mime| mime.essence_str().to_string())
                .unwrap_or_default();
            let data = match read_field(&mut field, max_image_bytes).await? {
                FieldData::Complete(data) => data,
                FieldData::Overflow { received } => {
                    return Err(AnalysisError::InvalidImage(InvalidImageError::TooLarge {
                        size: received,
                        limit: max_image_bytes,
                    })
                    .into());
                }
            };
            form.image = Some((data, content_type));
            continue;
        }

        let raw = match read_field(&mut field, TEXT_FIELD_LIMIT).await? {
            FieldData::Complete(raw) => raw,
            FieldData::Overflow { .. } => return Err(FormError::FieldTooLarge(name).into()),
        };
        let value = String::from_utf8_lossy(&raw).to_string();
        if value.trim().is_empty() {
            continue;
        }
        match name.as_str() {
            "calibration_mm_per_px" => {
                let ratio: f32 = parse(&name, &value)?;
                if !(ratio.is_finite() && ratio > 0.0) {
                    return Err(FormError::InvalidField { field: name.clone(), value }.into());
                }
                form.mm_per_pixel = Some(ratio);
            }
            "age" => {
                form.patient.age = Some(parse(&name, &value)?);
                form.has_patient = true;
            }
            "family_history" => {
                form.patient.family_history = parse_flag(&name, &value)?;
                form.has_patient = true;
            }
            "prior_lesion_count" => {
                form.patient.prior_lesion_count = parse(&name, &value)?;
                form.has_patient = true;
            }
            "regular_skin_checks" => {
                form.patient.regular_skin_checks = parse_flag(&name, &value)?;
                form.has_patient = true;
            }
            "smoker" => {
                form.patient.smoker = Some(parse_flag(&name, &value)?);
                form.has_patient = true;
            }
            "target_class" => {
                form.target_class = Some(parse(&name, &value)?);
            }
            "overlay" => {
                form.include_overlay = parse_flag(&name, &value)?;
            }
            other => {
                log::debug!("Ignoring unknown multipart field {}", other);
            }
        }
    }

    Ok(form)
}

async fn handle_analyze(
    analyzer: web::Data<Analyzer>,
    mut payload: Multipart,
) -> Result<HttpResponse, Error> {
    let form = read_form(&mut payload, analyzer.max_upload_bytes()).await?;
    let (image_data, content_type) = form.image.ok_or(FormError::MissingImage)?;
    let mm_per_pixel = form.mm_per_pixel;
    let patient = form.has_patient.then_some(form.patient);
    let target_class = form.target_class;
    let include_overlay = form.include_overlay;

    let worker = analyzer.clone();
    let result = web::block(move || {
        let mut request = AnalysisRequest::new(&image_data, &content_type);
        request.mm_per_pixel = mm_per_pixel;
        request.patient = patient;
        request.target_class = target_class;
        worker.analyze(request)
    })
    .await?;

    match result {
        Ok(result) => Ok(HttpResponse::Ok().json(result.to_response(include_overlay))),
        Err(e) => {
            match &e {
                AnalysisError::InvalidImage(reason) => log::info!("Rejected upload: {}", reason),
                AnalysisError::Inference(reason) => log::error!("Analysis failed: {}", reason),
            }
            Err(e.into())
        }
    }
}

async fn health(analyzer: web::Data<Analyzer>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "ok",
        "degraded": analyzer.model().is_degraded(),
    }))
}

async fn model_info(analyzer: web::Data<Analyzer>) -> HttpResponse {
    HttpResponse::Ok().json(analyzer.model().info())
}
