//! Domain errors and their HTTP mapping

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{ClockTime, ScheduleStatus};

/// Error descriptor returned by the hosted backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{code}: {message}")]
pub struct RemoteError {
    pub code: String,
    pub message: String,
}

impl RemoteError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),

    #[error("Já existe um agendamento neste horário ({date} {start}-{end}, agendamento {existing_id})")]
    Conflict {
        existing_id: String,
        date: NaiveDate,
        start: ClockTime,
        end: ClockTime,
    },

    #[error("{kind} '{id}' não encontrado")]
    NotFound { kind: &'static str, id: String },

    #[error("Transição de status inválida: {from} -> {to}")]
    InvalidTransition {
        from: ScheduleStatus,
        to: ScheduleStatus,
    },

    #[error("Já existe um serviço em andamento (agendamento {0})")]
    AnotherServiceActive(String),

    #[error("Erro no servidor remoto: {0}")]
    Remote(#[from] RemoteError),

    #[error("Erro de arquivo: {0}")]
    File(String),

    #[error("Erro interno do servidor")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Conflict { .. } | Self::InvalidTransition { .. } | Self::AnotherServiceActive(_) => {
                StatusCode::CONFLICT
            }
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Remote(_) => StatusCode::BAD_GATEWAY,
            Self::File(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = match &self {
            Self::Internal(inner) => {
                tracing::error!(error = %inner, "Internal error");
                self.to_string()
            }
            Self::Remote(inner) => {
                tracing::warn!(code = %inner.code, message = %inner.message, "Remote error");
                self.to_string()
            }
            Self::File(_) => {
                tracing::warn!(error = %self, "File operation failed");
                self.to_string()
            }
            _ => self.to_string(),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
