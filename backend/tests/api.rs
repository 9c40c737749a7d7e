use std::io::Cursor;
use std::sync::Arc;

use actix_web::http::StatusCode;
use actix_web::http::header::CONTENT_TYPE;
use actix_web::{App, test, web};
use derm_backend::Analyzer;
use derm_backend::config::AppConfig;
use derm_backend::model::Model;
use derm_backend::model::native::NativeClassifier;
use derm_backend::routes::configure_routes;
use image::{ImageFormat, Rgb, RgbImage};
use serde_json::Value;

const BOUNDARY: &str = "----derm-test-boundary";

fn png(width: u32, height: u32, lesion: bool) -> Vec<u8> {
    let mut img = RgbImage::from_pixel(width, height, Rgb([224, 188, 166]));
    if lesion {
        let (cx, cy) = (width as i64 / 2, height as i64 / 2);
        for (x, y, px) in img.enumerate_pixels_mut() {
            let dx = x as i64 - cx;
            let dy = y as i64 - cy;
            if dx * dx + dy * dy <= 40 * 40 {
                *px = Rgb([70, 42, 32]);
            }
        }
    }
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Png).unwrap();
    buf.into_inner()
}

enum Part<'a> {
    File(&'a str, &'a [u8], &'a str),
    Text(&'a str, &'a str),
}

fn multipart(parts: &[Part<'_>]) -> Vec<u8> {
    let mut body = Vec::new();
    for part in parts {
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        match part {
            Part::File(name, data, content_type) => {
                body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{name}\"; filename=\"lesion.png\"\r\nContent-Type: {content_type}\r\n\r\n"
                    )
                    .as_bytes(),
                );
                body.extend_from_slice(data);
            }
            Part::Text(name, value) => {
                body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}")
                        .as_bytes(),
                );
            }
        }
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    body
}

fn analyze_request(parts: &[Part<'_>]) -> test::TestRequest {
    test::TestRequest::post()
        .uri("/api/analyze")
        .insert_header((
            CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        ))
        .set_payload(multipart(parts))
}

fn analyzer() -> web::Data<Analyzer> {
    let model = Model::new(Arc::new(NativeClassifier::random(13)));
    web::Data::new(Analyzer::new(model, &AppConfig::default()))
}

#[actix_web::test]
async fn analyze_returns_full_report() {
    let app = test::init_service(
        App::new()
            .app_data(analyzer())
            .configure(configure_routes),
    )
    .await;
    let image = png(256, 256, true);
    let req = analyze_request(&[
        Part::File("image", &image, "image/png"),
        Part::Text("calibration_mm_per_px", "0.05"),
        Part::Text("age", "67"),
        Part::Text("family_history", "true"),
        Part::Text("overlay", "yes"),
    ])
    .to_request();

    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = test::read_body_json(resp).await;

    assert_eq!(body["degraded"], Value::Bool(false));
    assert_eq!(body["classification"]["ranked"].as_array().unwrap().len(), 8);
    assert_eq!(body["abcde"]["diameter"]["status"], "calibrated");
    assert!(body["attention"]["overlay_png_base64"].is_string());
    assert!(body["skin_tone"]["fitzpatrick"].is_string());
    let factors = body["risk_assessment"]["risk_factors"].as_array().unwrap();
    assert!(factors.iter().any(|f| f["tag"] == "family_history"));
    assert!(factors.iter().any(|f| f["tag"] == "age"));
}

#[actix_web::test]
async fn tiny_image_is_a_client_error() {
    let app = test::init_service(
        App::new()
            .app_data(analyzer())
            .configure(configure_routes),
    )
    .await;
    let image = png(10, 10, false);
    let req = analyze_request(&[Part::File("image", &image, "image/png")]).to_request();

    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["kind"], "invalid_image");
}

#[actix_web::test]
async fn missing_image_field_is_rejected() {
    let app = test::init_service(
        App::new()
            .app_data(analyzer())
            .configure(configure_routes),
    )
    .await;
    let req = analyze_request(&[Part::Text("age", "40")]).to_request();

    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["kind"], "invalid_request");
}

#[actix_web::test]
async fn bad_calibration_is_rejected() {
    let app = test::init_service(
        App::new()
            .app_data(analyzer())
            .configure(configure_routes),
    )
    .await;
    let image = png(256, 256, true);
    let req = analyze_request(&[
        Part::File("image", &image, "image/png"),
        Part::Text("calibration_mm_per_px", "-2"),
    ])
    .to_request();

    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[actix_web::test]
async fn health_and_model_info() {
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(Analyzer::new(
                Model::degraded(Some(1)),
                &AppConfig::default(),
            )))
            .configure(configure_routes),
    )
    .await;

    let req = test::TestRequest::get().uri("/api/health").to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["degraded"], Value::Bool(true));

    let req = test::TestRequest::get().uri("/api/model").to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["backend"], "native");
    assert_eq!(body["classes"].as_array().unwrap().len(), 8);
    assert_eq!(body["degraded"], Value::Bool(true));
}
