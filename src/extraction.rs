use crate::config::ExtractionSettings;
use crate::db_types::Urgency;
use crate::error::CallError;
use crate::inference::{ChainSession, InstructionMode};
use crate::phone::{is_contactable, normalize_number};
use crate::profile::BusinessProfile;
use crate::types::{BusinessMode, CallSession, ChatMessage};
use crate::utils::{format_date, parse_clock, resolve_date};

use serde::{Deserialize, Serialize};
use time::Date;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookingKind {
    Appointment,
    Inquiry,
    None,
}

impl BookingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingKind::Appointment => "appointment",
            BookingKind::Inquiry => "inquiry",
            BookingKind::None => "none",
        }
    }

    fn from_label(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "appointment" | "termin" | "reservierung" => Some(BookingKind::Appointment),
            "inquiry" | "anfrage" | "auftrag" => Some(BookingKind::Inquiry),
            "none" | "keine" | "null" => Some(BookingKind::None),
            _ => None,
        }
    }
}

impl From<BusinessMode> for BookingKind {
    fn from(mode: BusinessMode) -> Self {
        match mode {
            BusinessMode::Appointment => BookingKind::Appointment,
            BusinessMode::Inquiry => BookingKind::Inquiry,
        }
    }
}

/// Structured intent extracted from a finished call.  Only valid drafts reach the store.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct BookingDraft {
    pub kind: Option<BookingKind>,
    pub customer_name: Option<String>,
    pub customer_phone: Option<String>,
    /// `YYYY-MM-DD` when resolvable, otherwise the caller's words
    pub requested_date: Option<String>,
    /// `HH:MM`
    pub requested_time: Option<String>,
    pub service_name: Option<String>,
    pub preferred_staff: Option<String>,
    pub description: Option<String>,
    pub customer_address: Option<String>,
    pub category: Option<String>,
    pub urgency: Urgency,
    pub notes: Option<String>,
    pub summary: Option<String>,
    pub valid: bool,
}

impl BookingDraft {
    pub fn none() -> Self {
        Self {
            kind: Some(BookingKind::None),
            ..Default::default()
        }
    }

    pub fn kind(&self) -> BookingKind {
        self.kind.unwrap_or(BookingKind::None)
    }
}

/// What the model is asked to return.  Every field is optional and may be `"null"`.
#[derive(Debug, Default, Deserialize)]
struct RawExtraction {
    #[serde(default)]
    has_booking_request: Option<serde_json::Value>,
    #[serde(default, alias = "booking_type")]
    kind: Option<String>,
    #[serde(default, alias = "name")]
    customer_name: Option<String>,
    #[serde(default, alias = "customer_phone")]
    phone: Option<String>,
    #[serde(default)]
    requested_date: Option<String>,
    #[serde(default, alias = "preferred_time")]
    requested_time: Option<String>,
    #[serde(default)]
    service_name: Option<String>,
    #[serde(default)]
    preferred_staff: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    concern: Option<String>,
    #[serde(default)]
    customer_address: Option<String>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    urgency: Option<String>,
    #[serde(default)]
    notes: Option<String>,
    #[serde(default)]
    party_size: Option<serde_json::Value>,
    #[serde(default)]
    confidence: Option<serde_json::Value>,
}

/// Facts about the call the model cannot know.
#[derive(Debug, Clone)]
pub struct DraftContext<'a> {
    pub caller_number: &'a str,
    pub mode: BusinessMode,
    pub call_date: Date,
    pub min_confidence: f32,
}

pub fn extraction_instruction(profile: &BusinessProfile) -> String {
    let default_kind = match profile.mode() {
        BusinessMode::Appointment => "termin",
        BusinessMode::Inquiry => "anfrage",
    };
    format!(
        r#"Analysiere das folgende Telefongespräch mit {name} und gib NUR ein JSON-Objekt zurück, ohne weiteren Text:
{{
  "has_booking_request": true/false,
  "booking_type": "termin", "anfrage" oder "none",
  "customer_name": "Name des Anrufers oder null",
  "phone": "Rückrufnummer, falls genannt, oder null",
  "concern": "Anliegen in einem Satz",
  "service_name": "gewünschte Leistung oder null",
  "preferred_staff": "gewünschte Mitarbeiterin oder null",
  "requested_date": "Datum wie genannt (z.B. morgen, Freitag, 2026-03-14) oder null",
  "requested_time": "Uhrzeit wie genannt (z.B. 10 Uhr, 14:30) oder null",
  "party_size": "Anzahl Personen oder null",
  "customer_address": "Adresse des Kunden oder null",
  "category": "Kategorie des Problems oder null",
  "urgency": "niedrig/normal/hoch/notfall",
  "description": "ausführliche Beschreibung des Anliegens oder null",
  "notes": "weitere Wünsche oder null",
  "confidence": Zahl zwischen 0 und 1
}}
"termin" bedeutet, der Anrufer möchte einen Termin. "anfrage" bedeutet ein Auftrag, ein Problem oder eine Frage.
Im Zweifel ist der Typ "{default_kind}". "none" nur, wenn kein echtes Anliegen besprochen wurde.
Relative Angaben wie "morgen" wörtlich übernehmen. "notfall" nur bei echten Notfällen."#,
        name = profile.name,
    )
}

/// Run the post-call extraction over the whole transcript.  Never fails: anything
/// unusable degrades to a `none` draft.
pub async fn extract_booking(
    chain: &mut ChainSession,
    session: &CallSession,
    settings: &ExtractionSettings,
) -> BookingDraft {
    if session.turns().iter().all(|t| t.caller_text.trim().is_empty()) {
        info!(call_id = session.call_id(), "nothing said by caller, skipping extraction");
        return BookingDraft::none();
    }
    let transcript = vec![ChatMessage::user(session.transcript())];
    let reply = match chain
        .complete(&transcript, session.profile(), InstructionMode::Extraction)
        .await
    {
        Ok(reply) => reply,
        Err(e) => {
            warn!(call_id = session.call_id(), error = %e, "extraction unavailable");
            return BookingDraft::none();
        }
    };
    let ctx = DraftContext {
        caller_number: session.caller_number(),
        mode: session.profile().mode(),
        call_date: session.started_at().date(),
        min_confidence: settings.min_confidence,
    };
    parse_draft(&reply.text, &ctx)
}

/// Turn a model reply into a draft, degrading invalid output to `none`.
pub fn parse_draft(raw: &str, ctx: &DraftContext) -> BookingDraft {
    match build_draft(raw, ctx) {
        Ok(draft) => {
            info!(kind = draft.kind().as_str(), "booking extracted");
            draft
        }
        Err(e) => {
            info!(error = %e, "no booking for this call");
            BookingDraft::none()
        }
    }
}

fn build_draft(raw: &str, ctx: &DraftContext) -> Result<BookingDraft, CallError> {
    let json = locate_json(raw)
        .ok_or_else(|| CallError::ExtractionInvalid("no JSON object in reply".to_string()))?;
    let extracted: RawExtraction = serde_json::from_str(json)
        .map_err(|e| CallError::ExtractionInvalid(format!("malformed JSON: {e}")))?;

    let confidence = extracted.confidence.as_ref().and_then(score).unwrap_or(1.0);
    if confidence < ctx.min_confidence {
        return Err(CallError::ExtractionInvalid(format!(
            "confidence {confidence} below {}",
            ctx.min_confidence
        )));
    }

    let labelled = clean(extracted.kind.clone()).and_then(|k| BookingKind::from_label(&k));
    let kind = match (extracted.has_booking_request.as_ref().and_then(flag), labelled) {
        (Some(false), _) | (_, Some(BookingKind::None)) => BookingKind::None,
        (_, Some(kind)) => kind,
        (Some(true), None) => ctx.mode.into(),
        (None, None) => BookingKind::None,
    };
    if kind == BookingKind::None {
        return Err(CallError::ExtractionInvalid("no booking intent".to_string()));
    }

    let customer_phone = clean(extracted.phone.clone())
        .map(|p| normalize_number(&p))
        .filter(|p| is_contactable(p))
        .or_else(|| Some(normalize_number(ctx.caller_number)).filter(|p| is_contactable(p)))
        .ok_or_else(|| CallError::ExtractionInvalid("no contactable phone number".to_string()))?;

    let date_raw = clean(extracted.requested_date);
    let time_raw = clean(extracted.requested_time);
    let requested_date = resolve_requested_date(date_raw.as_deref(), time_raw.as_deref(), ctx.call_date);
    let requested_time = time_raw
        .as_deref()
        .and_then(parse_clock)
        .or_else(|| date_raw.as_deref().filter(|d| d.to_lowercase().contains("uhr")).and_then(parse_clock))
        .or(time_raw);

    let concern = clean(extracted.concern);
    let description = clean(extracted.description).or_else(|| concern.clone());

    match kind {
        BookingKind::Appointment if requested_date.is_none() && requested_time.is_none() && description.is_none() => {
            return Err(CallError::ExtractionInvalid(
                "appointment without requested time or description".to_string(),
            ))
        }
        BookingKind::Inquiry if description.is_none() => {
            return Err(CallError::ExtractionInvalid("inquiry without description".to_string()))
        }
        _ => {}
    }

    let mut notes: Vec<String> = clean(extracted.notes).into_iter().collect();
    if let Some(size) = extracted.party_size.as_ref().and_then(party_size) {
        notes.push(format!("Personen: {size}"));
    }

    Ok(BookingDraft {
        kind: Some(kind),
        customer_name: clean(extracted.customer_name),
        customer_phone: Some(customer_phone),
        requested_date,
        requested_time,
        service_name: clean(extracted.service_name),
        preferred_staff: clean(extracted.preferred_staff),
        description,
        customer_address: clean(extracted.customer_address),
        category: clean(extracted.category),
        urgency: extracted.urgency.as_deref().map(Urgency::parse).unwrap_or_default(),
        notes: if notes.is_empty() { None } else { Some(notes.join("\n")) },
        summary: concern,
        valid: true,
    })
}

fn locate_json(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (end > start).then(|| &raw[start..=end])
}

/// Models like to answer "null", "" or "unbekannt" instead of omitting a field.
fn clean(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty() && !matches!(v.to_lowercase().as_str(), "null" | "none" | "unbekannt" | "n/a"))
}

fn resolve_requested_date(date_raw: Option<&str>, time_raw: Option<&str>, call_date: Date) -> Option<String> {
    if let Some(date) = date_raw.and_then(|d| resolve_date(d, call_date)) {
        return Some(format_date(date));
    }
    // "morgen um 10 Uhr" sometimes lands entirely in the time field
    if let Some(date) = time_raw.and_then(|t| resolve_date(t, call_date)) {
        return Some(format_date(date));
    }
    date_raw.map(str::to_string)
}

fn party_size(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::String(s) => clean(Some(s.clone())),
        _ => None,
    }
}

/// Models quote booleans now and then.
fn flag(value: &serde_json::Value) -> Option<bool> {
    match value {
        serde_json::Value::Bool(b) => Some(*b),
        serde_json::Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "ja" | "yes" => Some(true),
            "false" | "nein" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn score(value: &serde_json::Value) -> Option<f32> {
    match value {
        serde_json::Value::Number(n) => n.as_f64().map(|n| n as f32),
        serde_json::Value::String(s) => s.trim().replace(',', ".").parse().ok(),
        _ => None,
    }
}
