use actix_web::{error::ResponseError, http::StatusCode, HttpRequest, HttpResponse};
use log::{error, info, warn};
use serde_json::json;

use crate::error::LocationError;

pub struct ErrorHandler;

impl ErrorHandler {
    pub fn log_and_respond(
        status: StatusCode,
        message: &str,
        error_details: Option<&str>,
        request_info: Option<&str>,
    ) -> HttpResponse {
        let status_code = status.as_u16();

        match status_code {
            400 => {
                warn!("🚨 400 Bad Request - {}", message);
                if let Some(details) = error_details {
                    warn!("   📋 details: {}", details);
                }
                if let Some(req_info) = request_info {
                    warn!("   📡 request: {}", req_info);
                }
            }
            401 => {
                warn!("🔒 401 Unauthorized - {}", message);
                if let Some(details) = error_details {
                    warn!("   📋 details: {}", details);
                }
            }
            403 => {
                warn!("🚫 403 Forbidden - {}", message);
                if let Some(details) = error_details {
                    warn!("   📋 details: {}", details);
                }
            }
            404 => {
                info!("🔍 404 Not Found - {}", message);
            }
            500 => {
                error!("💥 500 Internal Server Error - {}", message);
                if let Some(details) = error_details {
                    error!("   📋 details: {}", details);
                }
            }
            _ => {
                error!(
                    "❓ {} {} - {}",
                    status_code,
                    status.canonical_reason().unwrap_or("Unknown"),
                    message
                );
                if let Some(details) = error_details {
                    error!("   📋 details: {}", details);
                }
            }
        }

        let response_body = json!({
            "success": false,
            "error": {
                "code": status_code,
                "message": message,
                "status": status.canonical_reason().unwrap_or("Unknown")
            }
        });

        HttpResponse::build(status).json(response_body)
    }

    pub fn bad_request(message: &str, details: Option<&str>, request_info: Option<&str>) -> HttpResponse {
        Self::log_and_respond(StatusCode::BAD_REQUEST, message, details, request_info)
    }

    pub fn unauthorized(message: &str, details: Option<&str>) -> HttpResponse {
        Self::log_and_respond(StatusCode::UNAUTHORIZED, message, details, None)
    }

    pub fn forbidden(message: &str, details: Option<&str>) -> HttpResponse {
        Self::log_and_respond(StatusCode::FORBIDDEN, message, details, None)
    }

    pub fn not_found(message: &str) -> HttpResponse {
        Self::log_and_respond(StatusCode::NOT_FOUND, message, None, None)
    }

    pub fn internal_server_error(message: &str, details: Option<&str>) -> HttpResponse {
        Self::log_and_respond(StatusCode::INTERNAL_SERVER_ERROR, message, details, None)
    }

    /// Rejects malformed JSON bodies and query strings before they reach a handler.
    pub fn payload_error<E: std::fmt::Display>(err: E, req: &HttpRequest) -> actix_web::Error {
        let details = err.to_string();
        let request_info = format!("{} {}", req.method(), req.uri());
        let response = Self::bad_request("Invalid request payload", Some(&details), Some(&request_info));
        actix_web::error::InternalError::from_response(details, response).into()
    }
}

impl ResponseError for LocationError {
    fn status_code(&self) -> StatusCode {
        match self {
            LocationError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            LocationError::Forbidden(_) => StatusCode::FORBIDDEN,
            LocationError::NotFound(_) => StatusCode::NOT_FOUND,
            LocationError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        match self {
            LocationError::InvalidInput(message) => ErrorHandler::bad_request(message, None, None),
            LocationError::Forbidden(message) => ErrorHandler::forbidden(message, None),
            LocationError::NotFound(message) => ErrorHandler::not_found(message),
            // store details go to the log only
            LocationError::Internal(err) => {
                ErrorHandler::internal_server_error("Internal server error", Some(&format!("{:#}", err)))
            }
        }
    }
}
