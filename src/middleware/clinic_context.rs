use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use uuid::Uuid;

use crate::error::ApiError;
use crate::models::AppState;

pub const CLINIC_HEADER: &str = "x-clinic-id";

/// Tenant the request acts on. The upstream auth layer sets `X-Clinic-Id`; without
/// it the configured clinic, then the first clinic in the store, is used.
#[derive(Debug, Clone, Copy)]
pub struct ClinicContext {
    pub clinic_id: Uuid,
}

impl FromRequestParts<AppState> for ClinicContext {
    type Rejection = ApiError;

    fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> impl std::future::Future<Output = Result<Self, Self::Rejection>> + Send {
        async move {
            if let Some(raw) = parts.headers.get(CLINIC_HEADER) {
                let clinic_id = raw
                    .to_str()
                    .ok()
                    .and_then(|s| s.trim().parse::<Uuid>().ok())
                    .ok_or_else(|| {
                        ApiError::BadRequest("INVALID_CLINIC", "X-Clinic-Id must be a UUID".into())
                    })?;
                return Ok(ClinicContext { clinic_id });
            }

            if let Some(clinic_id) = state.default_clinic_id {
                return Ok(ClinicContext { clinic_id });
            }

            let clinic_id = state
                .store
                .first_clinic_id()
                .await?
                .ok_or_else(|| ApiError::NotFound("NO_CLINIC", "no clinic configured".into()))?;
            Ok(ClinicContext { clinic_id })
        }
    }
}
