use crate::db_types::{
    Appointment, Business, CallRecord, CustomerIdentity, DuplicateRef, Inquiry, RecordKind,
    RecordStatus, Service, TurnRecord,
};
use crate::error::StoreError;
use crate::extraction::{BookingDraft, BookingKind};
use crate::phone::{normalize_number, PhoneClass, PhoneRules};
use crate::profile::mode_for_industry;
use crate::types::{BusinessMode, CallSession};
use crate::utils::{generate_token, now_rfc3339};

use serde::Deserialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, Transaction};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use time::format_description::well_known::Rfc3339;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error, info, warn};

const ACTIVE_FILTER: &str = "status NOT IN ('done', 'rejected', 'cancelled')";

#[derive(Debug, Clone, Deserialize)]
pub struct NewBusiness {
    pub name: String,
    #[serde(default)]
    pub business_type: String,
    #[serde(default)]
    pub mode: Option<BusinessMode>,
    #[serde(default)]
    pub owner_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewService {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub duration_minutes: i64,
    #[serde(default)]
    pub price_cents: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppointmentStatusUpdate {
    pub status: Option<RecordStatus>,
    #[serde(default)]
    pub confirmed_date: Option<String>,
    #[serde(default)]
    pub confirmed_time: Option<String>,
    #[serde(default)]
    pub rejection_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InquiryStatusUpdate {
    pub status: Option<RecordStatus>,
    #[serde(default)]
    pub response_text: Option<String>,
    #[serde(default)]
    pub estimated_cost: Option<String>,
    #[serde(default)]
    pub scheduled_date: Option<String>,
}

/// Result of writing a booking from a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedRecord {
    pub kind: RecordKind,
    pub id: i64,
    pub phone_class: PhoneClass,
    pub callback_required: bool,
    pub duplicate_of: Option<i64>,
}

/// SQLite-backed persistence for businesses, bookings, customer tokens and the call log.
/// Writes that touch one business run one at a time.
#[derive(Clone)]
pub struct BookingStore {
    pool: SqlitePool,
    phone_rules: PhoneRules,
    locks: Arc<Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>>,
}

impl BookingStore {
    pub async fn connect(database_url: &str, phone_rules: PhoneRules) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool_options = if database_url.contains(":memory:") {
            // every connection would get its own empty database
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool_options.connect_with(options).await?;
        sqlx::migrate!().run(&pool).await?;
        info!(database_url, "booking store ready");
        Ok(Self {
            pool,
            phone_rules,
            locks: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn phone_rules(&self) -> &PhoneRules {
        &self.phone_rules
    }

    async fn lock_business(&self, business_id: i64) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            locks.entry(business_id).or_default().clone()
        };
        lock.lock_owned().await
    }

    pub async fn create_business(&self, new: NewBusiness) -> Result<Business, StoreError> {
        let mode = new
            .mode
            .unwrap_or_else(|| mode_for_industry(&new.business_type));
        let id = sqlx::query(
            "INSERT INTO businesses (name, business_type, mode, owner_name, email, phone, address, access_token, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&new.name)
        .bind(&new.business_type)
        .bind(mode)
        .bind(&new.owner_name)
        .bind(&new.email)
        .bind(&new.phone)
        .bind(&new.address)
        .bind(generate_token())
        .bind(now_rfc3339())
        .execute(&self.pool)
        .await?
        .last_insert_rowid();
        info!(business_id = id, name = %new.name, mode = mode.as_str(), "business created");
        self.business(id).await?.ok_or(StoreError::NotFound)
    }

    pub async fn business(&self, id: i64) -> Result<Option<Business>, StoreError> {
        Ok(sqlx::query_as::<_, Business>("SELECT * FROM businesses WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn business_by_token(&self, token: &str) -> Result<Option<Business>, StoreError> {
        Ok(sqlx::query_as::<_, Business>(
            "SELECT * FROM businesses WHERE access_token = ? AND active = 1",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?)
    }

    /// Case-insensitive match on the company name, for profiles without a configured id.
    pub async fn business_by_name(&self, name: &str) -> Result<Option<Business>, StoreError> {
        Ok(sqlx::query_as::<_, Business>(
            "SELECT * FROM businesses WHERE name = ? COLLATE NOCASE AND active = 1 ORDER BY id LIMIT 1",
        )
        .bind(name.trim())
        .fetch_optional(&self.pool)
        .await?)
    }

    pub async fn add_service(&self, business_id: i64, new: NewService) -> Result<Service, StoreError> {
        let _guard = self.lock_business(business_id).await;
        let mut tx = self.pool.begin().await?;
        let next_order: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM services WHERE business_id = ?",
        )
        .bind(business_id)
        .fetch_one(&mut tx)
        .await?;
        let id = sqlx::query(
            "INSERT INTO services (business_id, name, description, duration_minutes, price_cents, sort_order)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(business_id)
        .bind(&new.name)
        .bind(&new.description)
        .bind(new.duration_minutes)
        .bind(new.price_cents)
        .bind(next_order)
        .execute(&mut tx)
        .await?
        .last_insert_rowid();
        let service = sqlx::query_as::<_, Service>("SELECT * FROM services WHERE id = ?")
            .bind(id)
            .fetch_one(&mut tx)
            .await?;
        tx.commit().await?;
        Ok(service)
    }

    pub async fn services(&self, business_id: i64) -> Result<Vec<Service>, StoreError> {
        Ok(sqlx::query_as::<_, Service>(
            "SELECT * FROM services WHERE business_id = ? AND active = 1 ORDER BY sort_order, id",
        )
        .bind(business_id)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Token for (business, phone); the same pair always gets the same token.
    pub async fn customer_token(&self, business_id: i64, phone: &str) -> Result<String, StoreError> {
        let phone = normalize_number(phone);
        let _guard = self.lock_business(business_id).await;
        let mut tx = self.pool.begin().await?;
        let token = token_in_tx(&mut tx, business_id, &phone).await?;
        tx.commit().await?;
        Ok(token)
    }

    pub async fn customer_by_token(&self, token: &str) -> Result<Option<CustomerIdentity>, StoreError> {
        Ok(sqlx::query_as::<_, CustomerIdentity>(
            "SELECT t.business_id, t.customer_phone, b.name AS business_name, b.phone AS business_phone
             FROM customer_tokens t JOIN businesses b ON b.id = t.business_id
             WHERE t.token = ? AND b.active = 1",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?)
    }

    /// Persist a valid draft as an appointment or inquiry.  `None` for drafts of kind none.
    pub async fn record_booking(
        &self,
        business_id: i64,
        draft: &BookingDraft,
        call_id: Option<&str>,
    ) -> Result<Option<CreatedRecord>, StoreError> {
        if !draft.valid {
            return Ok(None);
        }
        match draft.kind() {
            BookingKind::Appointment => Ok(Some(self.create_appointment(business_id, draft, call_id).await?)),
            BookingKind::Inquiry => Ok(Some(self.create_inquiry(business_id, draft, call_id).await?)),
            BookingKind::None => Ok(None),
        }
    }

    fn classify(&self, draft: &BookingDraft) -> (Option<String>, PhoneClass) {
        let phone = draft.customer_phone.as_deref().map(normalize_number);
        let class = phone
            .as_deref()
            .map(|p| self.phone_rules.classify(p))
            .unwrap_or(PhoneClass::Unknown);
        (phone, class)
    }

    pub async fn create_appointment(
        &self,
        business_id: i64,
        draft: &BookingDraft,
        call_id: Option<&str>,
    ) -> Result<CreatedRecord, StoreError> {
        let (phone, phone_class) = self.classify(draft);
        let callback_required = phone_class == PhoneClass::Landline;
        let now = now_rfc3339();

        let _guard = self.lock_business(business_id).await;
        let mut tx = self.pool.begin().await?;
        let duplicate_of =
            newest_active(&mut tx, RecordKind::Appointment, business_id, phone.as_deref()).await?;
        let id = sqlx::query(
            "INSERT INTO appointments (business_id, call_id, customer_name, customer_phone, phone_class,
                service_name, preferred_staff, requested_date, requested_time, description, notes,
                status, callback_required, duplicate_of, call_summary, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(business_id)
        .bind(call_id)
        .bind(&draft.customer_name)
        .bind(&phone)
        .bind(phone_class)
        .bind(&draft.service_name)
        .bind(&draft.preferred_staff)
        .bind(&draft.requested_date)
        .bind(&draft.requested_time)
        .bind(&draft.description)
        .bind(&draft.notes)
        .bind(RecordStatus::New)
        .bind(callback_required)
        .bind(duplicate_of)
        .bind(&draft.summary)
        .bind(&now)
        .bind(&now)
        .execute(&mut tx)
        .await?
        .last_insert_rowid();
        tx.commit().await?;

        if let Some(original) = duplicate_of {
            warn!(business_id, appointment_id = id, duplicate_of = original, "possible duplicate appointment");
        }
        info!(business_id, appointment_id = id, phone_class = phone_class.as_str(), "appointment created");
        Ok(CreatedRecord {
            kind: RecordKind::Appointment,
            id,
            phone_class,
            callback_required,
            duplicate_of,
        })
    }

    pub async fn create_inquiry(
        &self,
        business_id: i64,
        draft: &BookingDraft,
        call_id: Option<&str>,
    ) -> Result<CreatedRecord, StoreError> {
        let (phone, phone_class) = self.classify(draft);
        let callback_required = phone_class == PhoneClass::Landline;
        let now = now_rfc3339();

        let _guard = self.lock_business(business_id).await;
        let mut tx = self.pool.begin().await?;
        let duplicate_of =
            newest_active(&mut tx, RecordKind::Inquiry, business_id, phone.as_deref()).await?;
        let id = sqlx::query(
            "INSERT INTO inquiries (business_id, call_id, customer_name, customer_phone, customer_address,
                phone_class, category, description, urgency, notes, status, callback_required,
                duplicate_of, call_summary, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(business_id)
        .bind(call_id)
        .bind(&draft.customer_name)
        .bind(&phone)
        .bind(&draft.customer_address)
        .bind(phone_class)
        .bind(&draft.category)
        .bind(&draft.description)
        .bind(draft.urgency)
        .bind(&draft.notes)
        .bind(RecordStatus::New)
        .bind(callback_required)
        .bind(duplicate_of)
        .bind(&draft.summary)
        .bind(&now)
        .bind(&now)
        .execute(&mut tx)
        .await?
        .last_insert_rowid();
        tx.commit().await?;

        if let Some(original) = duplicate_of {
            warn!(business_id, inquiry_id = id, duplicate_of = original, "possible duplicate inquiry");
        }
        info!(business_id, inquiry_id = id, phone_class = phone_class.as_str(), "inquiry created");
        Ok(CreatedRecord {
            kind: RecordKind::Inquiry,
            id,
            phone_class,
            callback_required,
            duplicate_of,
        })
    }

    pub async fn appointments(
        &self,
        business_id: i64,
        status: Option<RecordStatus>,
    ) -> Result<Vec<Appointment>, StoreError> {
        let rows = match status {
            Some(status) => {
                sqlx::query_as::<_, Appointment>(
                    "SELECT * FROM appointments WHERE business_id = ? AND status = ? ORDER BY id DESC",
                )
                .bind(business_id)
                .bind(status)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, Appointment>(
                    "SELECT * FROM appointments WHERE business_id = ? ORDER BY id DESC",
                )
                .bind(business_id)
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(rows)
    }

    pub async fn appointment(&self, business_id: i64, id: i64) -> Result<Option<Appointment>, StoreError> {
        Ok(sqlx::query_as::<_, Appointment>(
            "SELECT * FROM appointments WHERE business_id = ? AND id = ?",
        )
        .bind(business_id)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?)
    }

    pub async fn inquiries(
        &self,
        business_id: i64,
        status: Option<RecordStatus>,
    ) -> Result<Vec<Inquiry>, StoreError> {
        let rows = match status {
            Some(status) => {
                sqlx::query_as::<_, Inquiry>(
                    "SELECT * FROM inquiries WHERE business_id = ? AND status = ? ORDER BY id DESC",
                )
                .bind(business_id)
                .bind(status)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, Inquiry>(
                    "SELECT * FROM inquiries WHERE business_id = ? ORDER BY id DESC",
                )
                .bind(business_id)
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(rows)
    }

    pub async fn inquiry(&self, business_id: i64, id: i64) -> Result<Option<Inquiry>, StoreError> {
        Ok(sqlx::query_as::<_, Inquiry>(
            "SELECT * FROM inquiries WHERE business_id = ? AND id = ?",
        )
        .bind(business_id)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?)
    }

    /// Confirming falls back to the requested date/time; rescheduling needs both.
    pub async fn update_appointment_status(
        &self,
        business_id: i64,
        id: i64,
        update: AppointmentStatusUpdate,
    ) -> Result<Appointment, StoreError> {
        let status = update
            .status
            .ok_or_else(|| StoreError::InvalidUpdate("status is required".to_string()))?;
        let _guard = self.lock_business(business_id).await;
        let mut tx = self.pool.begin().await?;
        let current = sqlx::query_as::<_, Appointment>(
            "SELECT * FROM appointments WHERE business_id = ? AND id = ?",
        )
        .bind(business_id)
        .bind(id)
        .fetch_optional(&mut tx)
        .await?
        .ok_or(StoreError::NotFound)?;

        let (confirmed_date, confirmed_time) = match status {
            RecordStatus::Confirmed => (
                update.confirmed_date.or(current.confirmed_date).or(current.requested_date),
                update.confirmed_time.or(current.confirmed_time).or(current.requested_time),
            ),
            RecordStatus::Rescheduled => match (update.confirmed_date, update.confirmed_time) {
                (Some(date), Some(time)) => (Some(date), Some(time)),
                _ => {
                    return Err(StoreError::InvalidUpdate(
                        "rescheduling needs a new date and time".to_string(),
                    ))
                }
            },
            _ => (current.confirmed_date, current.confirmed_time),
        };
        let rejection_reason = match status {
            RecordStatus::Rejected => update.rejection_reason.or(current.rejection_reason),
            _ => current.rejection_reason,
        };

        sqlx::query(
            "UPDATE appointments SET status = ?, confirmed_date = ?, confirmed_time = ?,
                rejection_reason = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status)
        .bind(&confirmed_date)
        .bind(&confirmed_time)
        .bind(&rejection_reason)
        .bind(now_rfc3339())
        .bind(id)
        .execute(&mut tx)
        .await?;
        let updated = sqlx::query_as::<_, Appointment>("SELECT * FROM appointments WHERE id = ?")
            .bind(id)
            .fetch_one(&mut tx)
            .await?;
        tx.commit().await?;
        info!(business_id, appointment_id = id, status = status.as_str(), "appointment status changed");
        Ok(updated)
    }

    pub async fn update_inquiry_status(
        &self,
        business_id: i64,
        id: i64,
        update: InquiryStatusUpdate,
    ) -> Result<Inquiry, StoreError> {
        let status = update
            .status
            .ok_or_else(|| StoreError::InvalidUpdate("status is required".to_string()))?;
        let _guard = self.lock_business(business_id).await;
        let mut tx = self.pool.begin().await?;
        let affected = sqlx::query(
            "UPDATE inquiries SET status = ?,
                response_text = COALESCE(?, response_text),
                estimated_cost = COALESCE(?, estimated_cost),
                scheduled_date = COALESCE(?, scheduled_date),
                updated_at = ?
             WHERE business_id = ? AND id = ?",
        )
        .bind(status)
        .bind(&update.response_text)
        .bind(&update.estimated_cost)
        .bind(&update.scheduled_date)
        .bind(now_rfc3339())
        .bind(business_id)
        .bind(id)
        .execute(&mut tx)
        .await?
        .rows_affected();
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        let updated = sqlx::query_as::<_, Inquiry>("SELECT * FROM inquiries WHERE id = ?")
            .bind(id)
            .fetch_one(&mut tx)
            .await?;
        tx.commit().await?;
        info!(business_id, inquiry_id = id, status = status.as_str(), "inquiry status changed");
        Ok(updated)
    }

    pub async fn update_notes(
        &self,
        kind: RecordKind,
        business_id: i64,
        id: i64,
        notes: &str,
    ) -> Result<(), StoreError> {
        let _guard = self.lock_business(business_id).await;
        let sql = format!(
            "UPDATE {} SET business_notes = ?, updated_at = ? WHERE business_id = ? AND id = ?",
            kind.table()
        );
        let affected = sqlx::query(&sql)
            .bind(notes)
            .bind(now_rfc3339())
            .bind(business_id)
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub async fn mark_callback_done(&self, kind: RecordKind, business_id: i64, id: i64) -> Result<(), StoreError> {
        let _guard = self.lock_business(business_id).await;
        let sql = format!(
            "UPDATE {} SET callback_done = 1, updated_at = ? WHERE business_id = ? AND id = ?",
            kind.table()
        );
        let affected = sqlx::query(&sql)
            .bind(now_rfc3339())
            .bind(business_id)
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Active records of the same caller, newest first.
    pub async fn find_duplicates(
        &self,
        kind: RecordKind,
        business_id: i64,
        phone: &str,
        exclude_id: Option<i64>,
    ) -> Result<Vec<DuplicateRef>, StoreError> {
        let sql = format!(
            "SELECT id, customer_name, status, created_at FROM {}
             WHERE business_id = ? AND customer_phone = ? AND id != ? AND {ACTIVE_FILTER}
             ORDER BY id DESC",
            kind.table()
        );
        Ok(sqlx::query_as::<_, DuplicateRef>(&sql)
            .bind(business_id)
            .bind(normalize_number(phone))
            .bind(exclude_id.unwrap_or(-1))
            .fetch_all(&self.pool)
            .await?)
    }

    pub async fn customer_appointments(&self, business_id: i64, phone: &str) -> Result<Vec<Appointment>, StoreError> {
        Ok(sqlx::query_as::<_, Appointment>(
            "SELECT * FROM appointments WHERE business_id = ? AND customer_phone = ? ORDER BY id DESC",
        )
        .bind(business_id)
        .bind(phone)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn customer_inquiries(&self, business_id: i64, phone: &str) -> Result<Vec<Inquiry>, StoreError> {
        Ok(sqlx::query_as::<_, Inquiry>(
            "SELECT * FROM inquiries WHERE business_id = ? AND customer_phone = ? ORDER BY id DESC",
        )
        .bind(business_id)
        .bind(phone)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn customer_owned_appointment(
        tx: &mut Transaction<'_, Sqlite>,
        business_id: i64,
        phone: &str,
        id: i64,
    ) -> Result<Appointment, StoreError> {
        sqlx::query_as::<_, Appointment>(
            "SELECT * FROM appointments WHERE business_id = ? AND customer_phone = ? AND id = ?",
        )
        .bind(business_id)
        .bind(phone)
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StoreError::NotFound)
    }

    pub async fn customer_cancel(&self, business_id: i64, phone: &str, id: i64) -> Result<Appointment, StoreError> {
        let _guard = self.lock_business(business_id).await;
        let mut tx = self.pool.begin().await?;
        let current = Self::customer_owned_appointment(&mut tx, business_id, phone, id).await?;
        if matches!(current.status, RecordStatus::Cancelled | RecordStatus::Done) {
            return Err(StoreError::InvalidUpdate(format!(
                "appointment is already {}",
                current.status.as_str()
            )));
        }
        sqlx::query("UPDATE appointments SET status = ?, updated_at = ? WHERE id = ?")
            .bind(RecordStatus::Cancelled)
            .bind(now_rfc3339())
            .bind(id)
            .execute(&mut tx)
            .await?;
        let updated = Self::customer_owned_appointment(&mut tx, business_id, phone, id).await?;
        tx.commit().await?;
        info!(business_id, appointment_id = id, "appointment cancelled by customer");
        Ok(updated)
    }

    /// Records the wish in the notes; the business decides.
    pub async fn customer_request_reschedule(
        &self,
        business_id: i64,
        phone: &str,
        id: i64,
        date: &str,
        time: &str,
    ) -> Result<Appointment, StoreError> {
        let _guard = self.lock_business(business_id).await;
        let mut tx = self.pool.begin().await?;
        let current = Self::customer_owned_appointment(&mut tx, business_id, phone, id).await?;
        if !current.status.is_active() {
            return Err(StoreError::InvalidUpdate(format!(
                "appointment is already {}",
                current.status.as_str()
            )));
        }
        let wish = format!("Kunde wünscht Verschiebung auf {date} {time}");
        let notes = match current.notes {
            Some(existing) if !existing.is_empty() => format!("{existing}\n{wish}"),
            _ => wish,
        };
        sqlx::query("UPDATE appointments SET notes = ?, updated_at = ? WHERE id = ?")
            .bind(&notes)
            .bind(now_rfc3339())
            .bind(id)
            .execute(&mut tx)
            .await?;
        let updated = Self::customer_owned_appointment(&mut tx, business_id, phone, id).await?;
        tx.commit().await?;
        Ok(updated)
    }

    /// Write the finished call and its turns in one transaction.
    pub async fn archive_call(
        &self,
        session: &CallSession,
        business_id: Option<i64>,
        booking_kind: BookingKind,
    ) -> Result<i64, StoreError> {
        let status = session
            .status()
            .map(|s| s.as_str())
            .unwrap_or("error");
        let started_at = session
            .started_at()
            .format(&Rfc3339)
            .unwrap_or_else(|_| now_rfc3339());
        let mut tx = self.pool.begin().await?;
        let call_row = sqlx::query(
            "INSERT INTO calls (call_id, business_id, caller_number, phone_class, status, booking_kind,
                transcript, started_at, ended_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(session.call_id())
        .bind(business_id)
        .bind(session.caller_number())
        .bind(session.phone_class())
        .bind(status)
        .bind(booking_kind.as_str())
        .bind(session.transcript())
        .bind(started_at)
        .bind(now_rfc3339())
        .execute(&mut tx)
        .await
        .map_err(|e| {
            error!(error = %e, call_id = session.call_id(), "failed to insert call row");
            e
        })?
        .last_insert_rowid();

        for turn in session.turns() {
            sqlx::query(
                "INSERT INTO turns (call, call_idx, caller_side, bot_side, provider, barge_in, degraded,
                    transcribe_ms, infer_ms, synthesize_ms, speak_ms)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(call_row)
            .bind(turn.index as i64)
            .bind(&turn.caller_text)
            .bind(&turn.reply_text)
            .bind(&turn.provider)
            .bind(turn.barge_in)
            .bind(turn.degraded)
            .bind(turn.latencies.transcribe.as_millis() as i64)
            .bind(turn.latencies.infer.as_millis() as i64)
            .bind(turn.latencies.synthesize.as_millis() as i64)
            .bind(turn.latencies.speak.as_millis() as i64)
            .execute(&mut tx)
            .await?;
        }
        tx.commit().await?;
        debug!(call_id = session.call_id(), turns = session.turns().len(), "call archived");
        Ok(call_row)
    }

    pub async fn recent_calls(&self, business_id: i64, limit: i64) -> Result<Vec<CallRecord>, StoreError> {
        Ok(sqlx::query_as::<_, CallRecord>(
            "SELECT * FROM calls WHERE business_id = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(business_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn call_by_call_id(&self, call_id: &str) -> Result<Option<CallRecord>, StoreError> {
        Ok(sqlx::query_as::<_, CallRecord>("SELECT * FROM calls WHERE call_id = ?")
            .bind(call_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn call_turns(&self, call_row: i64) -> Result<Vec<TurnRecord>, StoreError> {
        Ok(sqlx::query_as::<_, TurnRecord>(
            "SELECT id, call, call_idx, caller_side, bot_side, provider, barge_in, degraded
             FROM turns WHERE call = ? ORDER BY call_idx",
        )
        .bind(call_row)
        .fetch_all(&self.pool)
        .await?)
    }
}

async fn token_in_tx(
    tx: &mut Transaction<'_, Sqlite>,
    business_id: i64,
    phone: &str,
) -> Result<String, StoreError> {
    let select = "SELECT token FROM customer_tokens WHERE business_id = ? AND customer_phone = ?";
    if let Some(token) = sqlx::query_scalar::<_, String>(select)
        .bind(business_id)
        .bind(phone)
        .fetch_optional(&mut *tx)
        .await?
    {
        return Ok(token);
    }
    // OR IGNORE: a writer outside this process may have inserted the pair meanwhile
    sqlx::query(
        "INSERT OR IGNORE INTO customer_tokens (business_id, customer_phone, token, created_at)
         VALUES (?, ?, ?, ?)",
    )
    .bind(business_id)
    .bind(phone)
    .bind(generate_token())
    .bind(now_rfc3339())
    .execute(&mut *tx)
    .await?;
    Ok(sqlx::query_scalar::<_, String>(select)
        .bind(business_id)
        .bind(phone)
        .fetch_one(&mut *tx)
        .await?)
}

async fn newest_active(
    tx: &mut Transaction<'_, Sqlite>,
    kind: RecordKind,
    business_id: i64,
    phone: Option<&str>,
) -> Result<Option<i64>, StoreError> {
    let Some(phone) = phone else {
        return Ok(None);
    };
    let sql = format!(
        "SELECT id FROM {} WHERE business_id = ? AND customer_phone = ? AND {ACTIVE_FILTER}
         ORDER BY id DESC LIMIT 1",
        kind.table()
    );
    Ok(sqlx::query_scalar::<_, i64>(&sql)
        .bind(business_id)
        .bind(phone)
        .fetch_optional(&mut *tx)
        .await?)
}
