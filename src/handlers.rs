use crate::db_types::{
    Appointment, Business, CallRecord, DuplicateRef, Inquiry, RecordKind, RecordStatus, Service,
};
use crate::error::StoreError;
use crate::notify::{Sender, StatusNotice};
use crate::store::{AppointmentStatusUpdate, InquiryStatusUpdate};
use crate::types::{AppState, BusinessMode};

use axum::{
    async_trait,
    extract::{FromRequestParts, Path, Query, State},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

const BUSINESS_TOKEN_HEADER: &str = "x-business-token";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("missing or invalid access token")]
    Unauthorized,
    #[error("not found")]
    NotFound,
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::NotFound | ApiError::Store(StoreError::NotFound) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) | ApiError::Store(StoreError::InvalidUpdate(_)) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::Store(e) => {
                error!(error = %e, "booking store request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

/// Business resolved from `X-Business-Token` or `?token=`.
pub struct AuthBusiness(pub Business);

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AuthBusiness {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<AppState>) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(BUSINESS_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| {
                Query::<TokenQuery>::try_from_uri(&parts.uri)
                    .ok()
                    .and_then(|q| q.0.token)
            })
            .filter(|t| !t.is_empty())
            .ok_or(ApiError::Unauthorized)?;
        match state.store.business_by_token(&token).await? {
            Some(business) => Ok(AuthBusiness(business)),
            None => {
                warn!("request with unknown business token");
                Err(ApiError::Unauthorized)
            }
        }
    }
}

pub fn api_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/business", get(get_business))
        .route("/api/services", get(list_services))
        .route("/api/appointments", get(list_appointments))
        .route("/api/appointments/:id", get(get_appointment))
        .route("/api/appointments/:id/status", post(update_appointment_status))
        .route("/api/inquiries", get(list_inquiries))
        .route("/api/inquiries/:id", get(get_inquiry))
        .route("/api/inquiries/:id/status", post(update_inquiry_status))
        .route("/api/notes/:kind/:id", put(update_notes))
        .route("/api/callback/:kind/:id", post(mark_callback_done))
        .route("/api/duplicates", get(find_duplicates))
        .route("/api/calls", get(recent_calls))
        .route("/api/customer/bookings", get(customer_bookings))
        .route("/api/customer/appointments/:id/cancel", post(customer_cancel))
        .route("/api/customer/appointments/:id/reschedule", post(customer_reschedule))
        .route("/health", get(|| async { "ok" }))
        .with_state(state)
}

fn record_kind(raw: &str) -> Result<RecordKind, ApiError> {
    match raw {
        "appointments" | "appointment" | "termin" => Ok(RecordKind::Appointment),
        "inquiries" | "inquiry" | "auftrag" => Ok(RecordKind::Inquiry),
        other => Err(ApiError::BadRequest(format!("unknown record type '{other}'"))),
    }
}

fn sender(business: &Business) -> Sender {
    Sender {
        business_name: business.name.clone(),
        business_phone: business.phone.clone(),
    }
}

/// Portal token for SMS links; only mobile numbers get messages.
/// Landline customers get a token too; the dispatcher decides whether an SMS goes out.
async fn token_for(state: &AppState, business_id: i64, phone: Option<&str>) -> Option<String> {
    let phone = phone?;
    match state.store.customer_token(business_id, phone).await {
        Ok(token) => Some(token),
        Err(e) => {
            warn!(error = %e, "no customer token for status notice");
            None
        }
    }
}

async fn get_business(AuthBusiness(business): AuthBusiness) -> Json<Business> {
    Json(business)
}

async fn list_services(
    State(state): State<Arc<AppState>>,
    AuthBusiness(business): AuthBusiness,
) -> Result<Json<Vec<Service>>, ApiError> {
    Ok(Json(state.store.services(business.id).await?))
}

#[derive(Debug, Deserialize)]
struct StatusFilter {
    status: Option<RecordStatus>,
}

async fn list_appointments(
    State(state): State<Arc<AppState>>,
    AuthBusiness(business): AuthBusiness,
    Query(filter): Query<StatusFilter>,
) -> Result<Json<Vec<Appointment>>, ApiError> {
    Ok(Json(state.store.appointments(business.id, filter.status).await?))
}

async fn get_appointment(
    State(state): State<Arc<AppState>>,
    AuthBusiness(business): AuthBusiness,
    Path(id): Path<i64>,
) -> Result<Json<Appointment>, ApiError> {
    state
        .store
        .appointment(business.id, id)
        .await?
        .map(Json)
        .ok_or(ApiError::NotFound)
}

async fn update_appointment_status(
    State(state): State<Arc<AppState>>,
    AuthBusiness(business): AuthBusiness,
    Path(id): Path<i64>,
    Json(update): Json<AppointmentStatusUpdate>,
) -> Result<Json<Appointment>, ApiError> {
    let updated = state
        .store
        .update_appointment_status(business.id, id, update)
        .await?;
    let notice = match updated.status {
        RecordStatus::Confirmed => Some(StatusNotice::AppointmentConfirmed(updated.clone())),
        RecordStatus::Rejected => Some(StatusNotice::AppointmentRejected(updated.clone())),
        RecordStatus::Rescheduled => Some(StatusNotice::AppointmentRescheduled(updated.clone())),
        _ => None,
    };
    if let Some(notice) = notice {
        let token = token_for(
            &state,
            business.id,
            updated.customer_phone.as_deref(),
        )
        .await;
        state
            .dispatcher
            .spawn_status_changed(notice, sender(&business), token);
    }
    Ok(Json(updated))
}

async fn list_inquiries(
    State(state): State<Arc<AppState>>,
    AuthBusiness(business): AuthBusiness,
    Query(filter): Query<StatusFilter>,
) -> Result<Json<Vec<Inquiry>>, ApiError> {
    Ok(Json(state.store.inquiries(business.id, filter.status).await?))
}

async fn get_inquiry(
    State(state): State<Arc<AppState>>,
    AuthBusiness(business): AuthBusiness,
    Path(id): Path<i64>,
) -> Result<Json<Inquiry>, ApiError> {
    state
        .store
        .inquiry(business.id, id)
        .await?
        .map(Json)
        .ok_or(ApiError::NotFound)
}

/// The customer hears about it once the business wrote an answer.
async fn update_inquiry_status(
    State(state): State<Arc<AppState>>,
    AuthBusiness(business): AuthBusiness,
    Path(id): Path<i64>,
    Json(update): Json<InquiryStatusUpdate>,
) -> Result<Json<Inquiry>, ApiError> {
    let answered = update
        .response_text
        .as_deref()
        .map_or(false, |t| !t.trim().is_empty());
    let updated = state.store.update_inquiry_status(business.id, id, update).await?;
    if answered {
        let token = token_for(
            &state,
            business.id,
            updated.customer_phone.as_deref(),
        )
        .await;
        state.dispatcher.spawn_status_changed(
            StatusNotice::InquiryAnswered(updated.clone()),
            sender(&business),
            token,
        );
    }
    Ok(Json(updated))
}

#[derive(Debug, Deserialize)]
struct NotesBody {
    #[serde(default)]
    notes: String,
}

#[derive(Debug, Serialize)]
struct Ack {
    ok: bool,
}

async fn update_notes(
    State(state): State<Arc<AppState>>,
    AuthBusiness(business): AuthBusiness,
    Path((kind, id)): Path<(String, i64)>,
    Json(body): Json<NotesBody>,
) -> Result<Json<Ack>, ApiError> {
    let kind = record_kind(&kind)?;
    state
        .store
        .update_notes(kind, business.id, id, &body.notes)
        .await?;
    Ok(Json(Ack { ok: true }))
}

async fn mark_callback_done(
    State(state): State<Arc<AppState>>,
    AuthBusiness(business): AuthBusiness,
    Path((kind, id)): Path<(String, i64)>,
) -> Result<Json<Ack>, ApiError> {
    let kind = record_kind(&kind)?;
    state.store.mark_callback_done(kind, business.id, id).await?;
    info!(business_id = business.id, id, "callback done");
    Ok(Json(Ack { ok: true }))
}

#[derive(Debug, Deserialize)]
struct DuplicateQuery {
    phone: Option<String>,
    kind: Option<String>,
    exclude_id: Option<i64>,
}

async fn find_duplicates(
    State(state): State<Arc<AppState>>,
    AuthBusiness(business): AuthBusiness,
    Query(query): Query<DuplicateQuery>,
) -> Result<Json<Vec<DuplicateRef>>, ApiError> {
    let phone = match query.phone.as_deref().map(str::trim) {
        Some(phone) if !phone.is_empty() => phone.to_string(),
        _ => return Ok(Json(vec![])),
    };
    let kind = match query.kind.as_deref() {
        Some(kind) => record_kind(kind)?,
        None => match business.mode {
            BusinessMode::Appointment => RecordKind::Appointment,
            BusinessMode::Inquiry => RecordKind::Inquiry,
        },
    };
    Ok(Json(
        state
            .store
            .find_duplicates(kind, business.id, &phone, query.exclude_id)
            .await?,
    ))
}

#[derive(Debug, Deserialize)]
struct CallsQuery {
    limit: Option<i64>,
}

async fn recent_calls(
    State(state): State<Arc<AppState>>,
    AuthBusiness(business): AuthBusiness,
    Query(query): Query<CallsQuery>,
) -> Result<Json<Vec<CallRecord>>, ApiError> {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    Ok(Json(state.store.recent_calls(business.id, limit).await?))
}

#[derive(Debug, Deserialize)]
struct CustomerQuery {
    t: Option<String>,
}

struct Customer {
    business: Business,
    phone: String,
}

async fn customer(state: &AppState, query: &CustomerQuery) -> Result<Customer, ApiError> {
    let token = query
        .t
        .as_deref()
        .filter(|t| !t.is_empty())
        .ok_or(ApiError::Unauthorized)?;
    let identity = state
        .store
        .customer_by_token(token)
        .await?
        .ok_or(ApiError::Unauthorized)?;
    let business = state
        .store
        .business(identity.business_id)
        .await?
        .ok_or(ApiError::NotFound)?;
    Ok(Customer {
        business,
        phone: identity.customer_phone,
    })
}

#[derive(Debug, Serialize)]
struct CustomerBookings {
    business_name: String,
    business_phone: Option<String>,
    appointments: Vec<Appointment>,
    inquiries: Vec<Inquiry>,
}

async fn customer_bookings(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CustomerQuery>,
) -> Result<Json<CustomerBookings>, ApiError> {
    let customer = customer(&state, &query).await?;
    let business_id = customer.business.id;
    Ok(Json(CustomerBookings {
        appointments: state
            .store
            .customer_appointments(business_id, &customer.phone)
            .await?,
        inquiries: state
            .store
            .customer_inquiries(business_id, &customer.phone)
            .await?,
        business_name: customer.business.name,
        business_phone: customer.business.phone,
    }))
}

async fn customer_cancel(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CustomerQuery>,
    Path(id): Path<i64>,
) -> Result<Json<Appointment>, ApiError> {
    let customer = customer(&state, &query).await?;
    let cancelled = state
        .store
        .customer_cancel(customer.business.id, &customer.phone, id)
        .await?;
    state.dispatcher.spawn_status_changed(
        StatusNotice::CancelledByCustomer(cancelled.clone()),
        sender(&customer.business),
        query.t.clone(),
    );
    Ok(Json(cancelled))
}

#[derive(Debug, Deserialize)]
struct RescheduleBody {
    date: String,
    time: String,
}

async fn customer_reschedule(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CustomerQuery>,
    Path(id): Path<i64>,
    Json(body): Json<RescheduleBody>,
) -> Result<Json<Appointment>, ApiError> {
    if body.date.trim().is_empty() || body.time.trim().is_empty() {
        return Err(ApiError::BadRequest("date and time are required".to_string()));
    }
    let customer = customer(&state, &query).await?;
    let updated = state
        .store
        .customer_request_reschedule(customer.business.id, &customer.phone, id, &body.date, &body.time)
        .await?;
    state.dispatcher.spawn_status_changed(
        StatusNotice::RescheduleRequested(updated.clone()),
        sender(&customer.business),
        query.t.clone(),
    );
    Ok(Json(updated))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extraction::{BookingDraft, BookingKind};
    use crate::testing::{test_app, ScriptedModel, TestApp};
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn send(app: &TestApp, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = api_router(app.state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    fn get(uri: &str, token: &str) -> Request<Body> {
        Request::get(uri)
            .header(BUSINESS_TOKEN_HEADER, token)
            .body(Body::empty())
            .unwrap()
    }

    fn json(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn booked(app: &TestApp, phone: &str) -> i64 {
        let draft = BookingDraft {
            kind: Some(BookingKind::Appointment),
            customer_name: Some("Anna Müller".to_string()),
            customer_phone: Some(phone.to_string()),
            requested_date: Some("2026-10-20".to_string()),
            requested_time: Some("10:00".to_string()),
            service_name: Some("Haarschnitt".to_string()),
            valid: true,
            ..Default::default()
        };
        app.state
            .store
            .record_booking(app.business.id, &draft, None)
            .await
            .unwrap()
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn requests_without_valid_token_are_rejected() {
        let app = test_app(vec![ScriptedModel::new("a")]).await;
        let (status, body) = send(&app, Request::get("/api/appointments").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body["error"].is_string());

        let (status, _) = send(&app, get("/api/appointments", "wrong")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn lists_appointments_by_header_or_query_token() {
        let app = test_app(vec![ScriptedModel::new("a")]).await;
        let id = booked(&app, "01711234567").await;
        let token = app.business.access_token.clone();

        let (status, body) = send(&app, get("/api/appointments?status=new", &token)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["id"], id);
        assert_eq!(body[0]["status"], "new");

        let uri = format!("/api/appointments/{id}?token={token}");
        let (status, body) = send(&app, Request::get(uri).body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["customer_name"], "Anna Müller");

        let (status, _) = send(&app, get("/api/appointments/9999", &token)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn confirming_an_appointment_texts_the_customer() {
        let app = test_app(vec![ScriptedModel::new("a")]).await;
        let id = booked(&app, "01711234567").await;
        let uri = format!("/api/appointments/{id}/status?token={}", app.business.access_token);

        let (status, body) = send(&app, json("POST", &uri, serde_json::json!({ "status": "confirmed" }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "confirmed");
        assert_eq!(body["confirmed_date"], "2026-10-20");

        for _ in 0..50 {
            if !app.sms.sent().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let sms = app.sms.sent();
        assert_eq!(sms.len(), 1);
        assert_eq!(sms[0].0, "01711234567");
    }

    #[tokio::test]
    async fn status_update_without_status_is_a_bad_request() {
        let app = test_app(vec![ScriptedModel::new("a")]).await;
        let id = booked(&app, "01711234567").await;
        let uri = format!("/api/appointments/{id}/status?token={}", app.business.access_token);
        let (status, _) = send(&app, json("POST", &uri, serde_json::json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn notes_and_callbacks_by_record_type() {
        let app = test_app(vec![ScriptedModel::new("a")]).await;
        let id = booked(&app, "030 1234567").await;
        let token = app.business.access_token.clone();

        let uri = format!("/api/notes/appointments/{id}?token={token}");
        let (status, _) = send(&app, json("PUT", &uri, serde_json::json!({ "notes": "Stammkundin" }))).await;
        assert_eq!(status, StatusCode::OK);
        let uri = format!("/api/callback/termin/{id}?token={token}");
        let (status, _) = send(&app, json("POST", &uri, serde_json::json!({}))).await;
        assert_eq!(status, StatusCode::OK);

        let appointment = app.state.store.appointment(app.business.id, id).await.unwrap().unwrap();
        assert_eq!(appointment.business_notes.as_deref(), Some("Stammkundin"));
        assert!(appointment.callback_done);

        let uri = format!("/api/notes/rechnungen/{id}?token={token}");
        let (status, _) = send(&app, json("PUT", &uri, serde_json::json!({ "notes": "x" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn duplicates_are_found_by_phone() {
        let app = test_app(vec![ScriptedModel::new("a")]).await;
        let first = booked(&app, "01711234567").await;
        booked(&app, "01711234567").await;
        let token = app.business.access_token.clone();

        let (status, body) = send(&app, get("/api/duplicates?phone=0171%201234567", &token)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 2);

        let uri = format!("/api/duplicates?phone=01711234567&kind=appointments&exclude_id={first}");
        let (_, body) = send(&app, get(&uri, &token)).await;
        assert_eq!(body.as_array().unwrap().len(), 1);

        let (_, body) = send(&app, get("/api/duplicates", &token)).await;
        assert_eq!(body, serde_json::json!([]));
    }

    #[tokio::test]
    async fn customer_sees_and_cancels_own_booking() {
        let app = test_app(vec![ScriptedModel::new("a")]).await;
        let id = booked(&app, "01711234567").await;
        let t = app
            .state
            .store
            .customer_token(app.business.id, "01711234567")
            .await
            .unwrap();

        let uri = format!("/api/customer/bookings?t={t}");
        let (status, body) = send(&app, Request::get(uri).body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["business_name"], "Salon Schnitt");
        assert_eq!(body["appointments"][0]["id"], id);

        let uri = format!("/api/customer/appointments/{id}/cancel?t={t}");
        let (status, body) = send(&app, json("POST", &uri, serde_json::json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "cancelled");

        let (status, _) = send(&app, json("POST", &uri, serde_json::json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(
            &app,
            Request::get("/api/customer/bookings?t=nope").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn customer_cannot_touch_someone_elses_booking() {
        let app = test_app(vec![ScriptedModel::new("a")]).await;
        let id = booked(&app, "01711234567").await;
        let t = app
            .state
            .store
            .customer_token(app.business.id, "01769999888")
            .await
            .unwrap();
        let uri = format!("/api/customer/appointments/{id}/reschedule?t={t}");
        let (status, _) = send(
            &app,
            json("POST", &uri, serde_json::json!({ "date": "2026-10-22", "time": "14:00" })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
