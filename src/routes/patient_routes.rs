// src/routes/patient_routes.rs

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
};
use serde::Deserialize;
use serde::de::Deserializer;
use uuid::Uuid;

use crate::{
    error::ApiError,
    middleware::clinic_context::ClinicContext,
    models::{AppState, Channel, LeadStatus, Patient},
    store::{NewPatient, PatientFilter, PatientPatch},
};

const DEFAULT_LIST_LIMIT: i64 = 50;
const MAX_LIST_LIMIT: i64 = 500;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/patients", post(create_patient).get(search_patients))
        .route(
            "/patients/{patient_id}",
            get(get_patient).patch(update_patient).delete(delete_patient),
        )
        .route("/patients/{patient_id}/status", post(set_lead_status))
}

fn deserialize_double_option<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    // only called when the field is present: null => Some(None)
    let inner = Option::<T>::deserialize(deserializer)?;
    Ok(Some(inner))
}

fn not_found() -> ApiError {
    ApiError::NotFound("NOT_FOUND", "patient not found".to_string())
}

fn trimmed(s: Option<String>) -> Option<String> {
    s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn clean_tags(tags: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(tags.len());
    for tag in tags {
        let tag = tag.trim().to_string();
        if !tag.is_empty() && !out.contains(&tag) {
            out.push(tag);
        }
    }
    out
}

#[derive(Debug, Deserialize)]
pub struct CreatePatientRequest {
    pub name: String,
    pub phone: String,
    pub channel: Option<Channel>,
    pub lead_status: Option<LeadStatus>,
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub notes: Option<String>,
    pub estimated_value: Option<f64>,
}

pub async fn create_patient(
    State(state): State<AppState>,
    clinic: ClinicContext,
    Json(req): Json<CreatePatientRequest>,
) -> Result<(StatusCode, Json<Patient>), ApiError> {
    let name = req.name.trim();
    if name.is_empty() {
        return Err(ApiError::validation("name is required"));
    }
    let phone = state.phones.normalize(&req.phone);
    if phone.is_empty() {
        return Err(ApiError::validation("phone is required"));
    }
    if req.estimated_value.is_some_and(|v| v < 0.0) {
        return Err(ApiError::validation("estimated_value must be >= 0"));
    }

    let row = state
        .store
        .insert_patient(NewPatient {
            clinic_id: clinic.clinic_id,
            name: name.to_string(),
            phone,
            channel: req.channel.unwrap_or(Channel::Whatsapp),
            lead_status: req.lead_status.unwrap_or(LeadStatus::New),
            avatar_url: trimmed(req.avatar_url),
            tags: clean_tags(req.tags),
            notes: trimmed(req.notes),
            estimated_value: req.estimated_value,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(row)))
}

pub async fn get_patient(
    State(state): State<AppState>,
    clinic: ClinicContext,
    Path(patient_id): Path<Uuid>,
) -> Result<Json<Patient>, ApiError> {
    let row = state
        .store
        .get_patient(clinic.clinic_id, patient_id)
        .await?
        .ok_or_else(not_found)?;
    Ok(Json(row))
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub query: Option<String>,
    pub status: Option<LeadStatus>,
    pub channel: Option<Channel>,
    pub limit: Option<i64>,
}

pub async fn search_patients(
    State(state): State<AppState>,
    clinic: ClinicContext,
    Query(q): Query<SearchQuery>,
) -> Result<Json<Vec<Patient>>, ApiError> {
    let filter = PatientFilter {
        query: trimmed(q.query),
        lead_status: q.status,
        channel: q.channel,
        limit: q
            .limit
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .clamp(1, MAX_LIST_LIMIT),
    };
    let rows = state.store.list_patients(clinic.clinic_id, &filter).await?;
    Ok(Json(rows))
}

#[derive(Debug, Deserialize)]
pub struct UpdatePatientRequest {
    pub name: Option<String>,
    pub phone: Option<String>,
    pub channel: Option<Channel>,
    pub lead_status: Option<LeadStatus>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub avatar_url: Option<Option<String>>,
    pub tags: Option<Vec<String>>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub notes: Option<Option<String>>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub estimated_value: Option<Option<f64>>,
}

pub async fn update_patient(
    State(state): State<AppState>,
    clinic: ClinicContext,
    Path(patient_id): Path<Uuid>,
    Json(req): Json<UpdatePatientRequest>,
) -> Result<Json<Patient>, ApiError> {
    let name = match req.name.as_deref().map(str::trim) {
        Some("") => return Err(ApiError::validation("name must not be empty")),
        other => other.map(str::to_string),
    };
    let phone = match req.phone.as_deref().map(|p| state.phones.normalize(p)) {
        Some(p) if p.is_empty() => return Err(ApiError::validation("phone must contain digits")),
        other => other,
    };
    if let Some(Some(v)) = req.estimated_value {
        if v < 0.0 {
            return Err(ApiError::validation("estimated_value must be >= 0"));
        }
    }

    let patch = PatientPatch {
        name,
        phone,
        channel: req.channel,
        lead_status: req.lead_status,
        // empty string clears, like null
        avatar_url: req.avatar_url.map(trimmed),
        tags: req.tags.map(clean_tags),
        notes: req.notes.map(trimmed),
        estimated_value: req.estimated_value,
    };

    let row = state
        .store
        .update_patient(clinic.clinic_id, patient_id, patch)
        .await?
        .ok_or_else(not_found)?;
    Ok(Json(row))
}

#[derive(Debug, Deserialize)]
pub struct SetStatusRequest {
    pub status: LeadStatus,
}

/// Any status may be set directly; the funnel is not enforced as a linear sequence.
pub async fn set_lead_status(
    State(state): State<AppState>,
    clinic: ClinicContext,
    Path(patient_id): Path<Uuid>,
    Json(req): Json<SetStatusRequest>,
) -> Result<Json<Patient>, ApiError> {
    let patch = PatientPatch {
        lead_status: Some(req.status),
        ..Default::default()
    };
    let row = state
        .store
        .update_patient(clinic.clinic_id, patient_id, patch)
        .await?
        .ok_or_else(not_found)?;
    tracing::info!(patient_id = %patient_id, status = %req.status, "lead status changed");
    Ok(Json(row))
}

pub async fn delete_patient(
    State(state): State<AppState>,
    clinic: ClinicContext,
    Path(patient_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    if !state.store.delete_patient(clinic.clinic_id, patient_id).await? {
        return Err(not_found());
    }
    tracing::info!(patient_id = %patient_id, "patient deleted");
    Ok(StatusCode::NO_CONTENT)
}
