//! Enrollment: validate an upload, extract the face, persist it and retrain.

use crate::engine::{EngineError, EngineHandle};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine as _;
use image::{GrayImage, ImageFormat};
use rollcall_core::Identity;
use rollcall_store::{DbError, Person, SqliteStore};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use thiserror::Error;

/// Standard alphabet that tolerates missing or partial `=` padding.
const LENIENT_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("field {0} is required")]
    MissingField(&'static str),
    #[error("invalid image")]
    InvalidImage,
    #[error("no face detected or face is incomplete")]
    NoUsableFace,
    #[error("store unavailable")]
    StoreUnavailable,
    #[error("store error: {0}")]
    Store(#[from] DbError),
    #[error("engine error: {0}")]
    Engine(EngineError),
    #[error("could not encode face: {0}")]
    Encode(#[from] image::ImageError),
}

impl From<EngineError> for EnrollError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::NoUsableFace => EnrollError::NoUsableFace,
            other => EnrollError::Engine(other),
        }
    }
}

impl EnrollError {
    fn status(&self) -> StatusCode {
        match self {
            EnrollError::MissingField(_) | EnrollError::InvalidImage | EnrollError::NoUsableFace => {
                StatusCode::BAD_REQUEST
            }
            EnrollError::StoreUnavailable
            | EnrollError::Store(_)
            | EnrollError::Engine(_)
            | EnrollError::Encode(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// `{status, message}` body shared by every enrollment response.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusBody {
    pub status: String,
    pub message: String,
}

impl IntoResponse for EnrollError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            EnrollError::Store(_) | EnrollError::Engine(_) | EnrollError::Encode(_) => {
                tracing::error!(error = %self, "enrollment failed");
                "internal error while processing image".to_string()
            }
            _ => {
                tracing::info!(error = %self, "enrollment rejected");
                self.to_string()
            }
        };
        let body = StatusBody {
            status: "error".to_string(),
            message,
        };
        (status, Json(body)).into_response()
    }
}

/// JSON body of `POST /upload`. Every field is required; presence is checked
/// by [`UploadRequest::validate`] so the error names the field.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRequest {
    pub image: Option<String>,
    pub national_code: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

#[derive(Debug)]
pub struct Enrollment {
    pub identity: Identity,
    pub first_name: String,
    pub last_name: String,
    pub image: GrayImage,
}

impl UploadRequest {
    pub fn validate(self) -> Result<Enrollment, EnrollError> {
        let image = required(self.image, "image")?;
        let national_code = required(self.national_code, "nationalCode")?;
        let first_name = required(self.first_name, "firstName")?;
        let last_name = required(self.last_name, "lastName")?;

        let identity = Identity::new(&national_code).map_err(|_| EnrollError::MissingField("nationalCode"))?;
        Ok(Enrollment {
            identity,
            first_name: first_name.trim().to_string(),
            last_name: last_name.trim().to_string(),
            image: decode_image(&image)?,
        })
    }
}

fn required(value: Option<String>, field: &'static str) -> Result<String, EnrollError> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or(EnrollError::MissingField(field))
}

/// Decode a base64 image, with or without a `data:image/...;base64,` prefix,
/// into grayscale.
pub fn decode_image(encoded: &str) -> Result<GrayImage, EnrollError> {
    let payload = match encoded.split_once(',') {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => encoded,
    };
    let payload: String = payload.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    let bytes = LENIENT_BASE64
        .decode(payload.as_bytes())
        .map_err(|_| EnrollError::InvalidImage)?;
    let image = image::load_from_memory(&bytes).map_err(|_| EnrollError::InvalidImage)?;
    Ok(image.to_luma8())
}

pub fn encode_png(image: &GrayImage) -> Result<Vec<u8>, image::ImageError> {
    let mut out = Cursor::new(Vec::new());
    image.write_to(&mut out, ImageFormat::Png)?;
    Ok(out.into_inner())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrollOutcome {
    Enrolled,
    /// The national code was already on file; the stored face is kept.
    AlreadyEnrolled,
}

/// Extract the face, store the person if new and train the matcher on the
/// new face.
pub async fn enroll(
    engine: &EngineHandle,
    store: &SqliteStore,
    enrollment: Enrollment,
) -> Result<EnrollOutcome, EnrollError> {
    let face = engine.extract_face(enrollment.image).await?;
    let person = Person {
        national_code: enrollment.identity.to_string(),
        first_name: enrollment.first_name,
        last_name: enrollment.last_name,
        image: encode_png(&face)?,
    };

    if !store.enroll(person).await? {
        tracing::info!(identity = %enrollment.identity, "already enrolled; keeping stored face");
        return Ok(EnrollOutcome::AlreadyEnrolled);
    }

    let gallery = engine.train(enrollment.identity.clone(), face).await?;
    tracing::info!(identity = %enrollment.identity, gallery, "person enrolled");
    Ok(EnrollOutcome::Enrolled)
}

/// Train the matcher on every stored face. Unreadable rows are skipped.
pub async fn bootstrap_gallery(engine: &EngineHandle, store: &SqliteStore) -> Result<usize, EnrollError> {
    let people = store.load_people().await?;
    let mut trained = 0;
    for person in people {
        let identity = match Identity::new(&person.national_code) {
            Ok(identity) => identity,
            Err(_) => {
                tracing::warn!("skipping stored person with empty national code");
                continue;
            }
        };
        let face = match image::load_from_memory(&person.image) {
            Ok(face) => face.to_luma8(),
            Err(err) => {
                tracing::warn!(%identity, error = %err, "skipping unreadable stored face");
                continue;
            }
        };
        engine.train(identity, face).await?;
        trained += 1;
    }
    tracing::info!(trained, "gallery loaded");
    Ok(trained)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing;
    use image::Luma;

    fn png_base64(value: u8) -> String {
        let png = encode_png(&GrayImage::from_pixel(40, 40, Luma([value]))).unwrap();
        base64::engine::general_purpose::STANDARD.encode(png)
    }

    fn upload(image: String) -> UploadRequest {
        UploadRequest {
            image: Some(image),
            national_code: Some("0012345678".into()),
            first_name: Some("Sara".into()),
            last_name: Some("Ahmadi".into()),
        }
    }

    #[test]
    fn test_missing_fields_named_in_order() {
        let err = UploadRequest::default().validate().unwrap_err();
        assert_eq!(err.to_string(), "field image is required");

        let mut req = upload(png_base64(9));
        req.last_name = Some("  ".into());
        assert_eq!(req.validate().unwrap_err().to_string(), "field lastName is required");
    }

    #[test]
    fn test_decode_accepts_data_uri_and_missing_padding() {
        let encoded = png_base64(80);
        let unpadded = encoded.trim_end_matches('=');
        assert_eq!(decode_image(unpadded).unwrap().dimensions(), (40, 40));

        let uri = format!("data:image/png;base64,{encoded}");
        assert_eq!(decode_image(&uri).unwrap().get_pixel(0, 0)[0], 80);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(decode_image("!!!not base64"), Err(EnrollError::InvalidImage)));
        let not_an_image = base64::engine::general_purpose::STANDARD.encode(b"hello world");
        assert!(matches!(decode_image(&not_an_image), Err(EnrollError::InvalidImage)));
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(EnrollError::MissingField("image").status(), StatusCode::BAD_REQUEST);
        assert_eq!(EnrollError::from(EngineError::NoUsableFace).status(), StatusCode::BAD_REQUEST);
        assert_eq!(EnrollError::StoreUnavailable.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            EnrollError::from(EngineError::ChannelClosed).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn test_enroll_stores_once_and_trains() {
        let engine = testing::engine(&[]);
        let store = SqliteStore::open_in_memory().await.unwrap();

        let outcome = enroll(&engine, &store, upload(png_base64(120)).validate().unwrap()).await.unwrap();
        assert_eq!(outcome, EnrollOutcome::Enrolled);
        let again = enroll(&engine, &store, upload(png_base64(60)).validate().unwrap()).await.unwrap();
        assert_eq!(again, EnrollOutcome::AlreadyEnrolled);

        let person = store.person(&Identity::new("0012345678").unwrap()).await.unwrap().unwrap();
        assert_eq!(person.display_name(), "Sara Ahmadi");
        let face = image::load_from_memory(&person.image).unwrap().to_luma8();
        assert_eq!(face.dimensions(), (200, 200));
        assert_eq!(face.get_pixel(100, 100)[0], 120);
    }

    #[tokio::test]
    async fn test_enroll_without_face_stores_nothing() {
        let engine = testing::engine(&[]);
        let store = SqliteStore::open_in_memory().await.unwrap();
        let err = enroll(&engine, &store, upload(png_base64(0)).validate().unwrap()).await.unwrap_err();
        assert!(matches!(err, EnrollError::NoUsableFace));
        assert!(store.load_people().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bootstrap_trains_stored_faces() {
        let engine = testing::engine(&[]);
        let store = SqliteStore::open_in_memory().await.unwrap();
        enroll(&engine, &store, upload(png_base64(120)).validate().unwrap()).await.unwrap();

        let fresh = testing::engine(&[]);
        assert_eq!(bootstrap_gallery(&fresh, &store).await.unwrap(), 1);
    }
}
