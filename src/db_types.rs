use crate::phone::PhoneClass;
use crate::types::BusinessMode;

use serde::{Deserialize, Serialize};

/// Lifecycle of an appointment or inquiry.  The call pipeline only ever writes `New`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "kebab-case")]
#[sqlx(rename_all = "kebab-case")]
pub enum RecordStatus {
    New,
    Confirmed,
    Rejected,
    Rescheduled,
    InProgress,
    Done,
    Cancelled,
}

impl RecordStatus {
    /// Statuses a record can no longer leave; such records never count as duplicates.
    pub const CLOSED: &'static [RecordStatus] =
        &[RecordStatus::Done, RecordStatus::Rejected, RecordStatus::Cancelled];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::New => "new",
            RecordStatus::Confirmed => "confirmed",
            RecordStatus::Rejected => "rejected",
            RecordStatus::Rescheduled => "rescheduled",
            RecordStatus::InProgress => "in-progress",
            RecordStatus::Done => "done",
            RecordStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_active(&self) -> bool {
        !Self::CLOSED.contains(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum Urgency {
    #[serde(alias = "niedrig")]
    Low,
    #[default]
    #[serde(alias = "mittel")]
    Normal,
    #[serde(alias = "hoch")]
    High,
    #[serde(alias = "notfall")]
    Emergency,
}

impl Urgency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Urgency::Low => "low",
            Urgency::Normal => "normal",
            Urgency::High => "high",
            Urgency::Emergency => "emergency",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "low" | "niedrig" => Urgency::Low,
            "high" | "hoch" | "dringend" => Urgency::High,
            "emergency" | "notfall" => Urgency::Emergency,
            _ => Urgency::Normal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Appointment,
    Inquiry,
}

impl RecordKind {
    pub(crate) fn table(&self) -> &'static str {
        match self {
            RecordKind::Appointment => "appointments",
            RecordKind::Inquiry => "inquiries",
        }
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Business {
    pub id: i64,
    pub name: String,
    pub business_type: String,
    pub mode: BusinessMode,
    pub owner_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
    #[serde(skip_serializing)]
    pub access_token: String,
    pub active: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Service {
    pub id: i64,
    pub business_id: i64,
    pub name: String,
    pub description: Option<String>,
    pub duration_minutes: i64,
    pub price_cents: Option<i64>,
    pub active: bool,
    pub sort_order: i64,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Appointment {
    pub id: i64,
    pub business_id: i64,
    pub call_id: Option<String>,
    pub customer_name: Option<String>,
    pub customer_phone: Option<String>,
    pub phone_class: PhoneClass,
    pub service_name: Option<String>,
    pub preferred_staff: Option<String>,
    pub requested_date: Option<String>,
    pub requested_time: Option<String>,
    pub description: Option<String>,
    pub notes: Option<String>,
    pub status: RecordStatus,
    pub confirmed_date: Option<String>,
    pub confirmed_time: Option<String>,
    pub rejection_reason: Option<String>,
    pub callback_required: bool,
    pub callback_done: bool,
    pub duplicate_of: Option<i64>,
    pub business_notes: Option<String>,
    pub call_summary: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Inquiry {
    pub id: i64,
    pub business_id: i64,
    pub call_id: Option<String>,
    pub customer_name: Option<String>,
    pub customer_phone: Option<String>,
    pub customer_address: Option<String>,
    pub phone_class: PhoneClass,
    pub category: Option<String>,
    pub description: Option<String>,
    pub urgency: Urgency,
    pub notes: Option<String>,
    pub status: RecordStatus,
    pub response_text: Option<String>,
    pub estimated_cost: Option<String>,
    pub scheduled_date: Option<String>,
    pub callback_required: bool,
    pub callback_done: bool,
    pub duplicate_of: Option<i64>,
    pub business_notes: Option<String>,
    pub call_summary: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Another active record from the same caller.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct DuplicateRef {
    pub id: i64,
    pub customer_name: Option<String>,
    pub status: RecordStatus,
    pub created_at: String,
}

/// Who a customer token belongs to.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct CustomerIdentity {
    pub business_id: i64,
    pub customer_phone: String,
    pub business_name: String,
    pub business_phone: Option<String>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct CallRecord {
    pub id: i64,
    pub call_id: String,
    pub business_id: Option<i64>,
    pub caller_number: String,
    pub phone_class: PhoneClass,
    pub status: String,
    pub booking_kind: String,
    pub transcript: String,
    pub started_at: String,
    pub ended_at: String,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct TurnRecord {
    pub id: i64,
    pub call: i64,
    pub call_idx: i64,
    pub caller_side: String,
    pub bot_side: String,
    pub provider: Option<String>,
    pub barge_in: bool,
    pub degraded: bool,
}
