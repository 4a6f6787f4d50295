use serde::Serialize;

use crate::error::ErrorCode;

#[derive(Debug, Clone, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorCode>,

    pub message: String,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T, message: String) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            message,
        }
    }

    /// `data` carries structured failure detail, such as the vendor trail.
    pub fn failure(error: ErrorCode, message: String, data: Option<T>) -> Self {
        Self {
            success: false,
            data,
            error: Some(error),
            message,
        }
    }
}
