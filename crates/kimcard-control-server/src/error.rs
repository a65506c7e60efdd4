use std::io;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use kimcard_machine::{MachineError, MountError};
use kimcard_storage::LibraryError;
use tracing::error;

/// HTTP-facing error: a status code plus an optional human-readable reason
/// carried in the body (409s carry one; other error bodies are empty).
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub reason: &'static str,
}

impl ApiError {
    pub fn bad_request() -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            reason: "",
        }
    }
}

/// Status used for structurally invalid IMD images.
pub fn invalid_image_status() -> StatusCode {
    StatusCode::from_u16(499).expect("499 is a valid status code")
}

impl From<MachineError> for ApiError {
    fn from(err: MachineError) -> Self {
        let (status, reason) = match &err {
            MachineError::Busy => (StatusCode::INTERNAL_SERVER_ERROR, ""),
            MachineError::Invalid(_) => (StatusCode::BAD_REQUEST, ""),
            MachineError::Mounted => (StatusCode::CONFLICT, "Image mounted"),
            MachineError::Mount(mount) => match mount {
                MountError::BadName => (StatusCode::BAD_REQUEST, ""),
                MountError::NotFound => (StatusCode::NOT_FOUND, ""),
                MountError::ImageMounted => (StatusCode::CONFLICT, "Image mounted"),
                MountError::DriveMounted => (StatusCode::CONFLICT, "Drive mounted"),
                MountError::BadDrive => (StatusCode::BAD_REQUEST, ""),
                MountError::InvalidImage(_) => (invalid_image_status(), ""),
                MountError::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, ""),
            },
            MachineError::Library(lib) => match lib {
                LibraryError::BadName => (StatusCode::BAD_REQUEST, ""),
                LibraryError::NotFound => (StatusCode::NOT_FOUND, ""),
                LibraryError::Exists => (StatusCode::CONFLICT, "Image exists"),
                LibraryError::InvalidImage(_) => (invalid_image_status(), ""),
                LibraryError::Io(io_err) if io_err.kind() == io::ErrorKind::StorageFull => {
                    (StatusCode::INSUFFICIENT_STORAGE, "")
                }
                LibraryError::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, ""),
            },
            MachineError::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, ""),
        };
        if status.is_server_error() {
            error!(%err, "request failed");
        }
        Self { status, reason }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, self.reason.to_string()).into_response()
    }
}
