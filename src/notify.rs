use crate::config::{EmailSettings, NotifySettings, SmsSettings, TelegramSettings};
use crate::db_types::{Appointment, Inquiry, RecordKind, Urgency};
use crate::error::{CallError, ConfigError};
use crate::extraction::BookingDraft;
use crate::phone::PhoneClass;
use crate::store::CreatedRecord;

use async_trait::async_trait;
use futures_util::future::join_all;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("transient delivery failure: {0}")]
    Transient(String),
    #[error("permanent delivery failure: {0}")]
    Permanent(String),
}

impl DeliveryError {
    fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let detail = format!("{status}: {body}");
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            DeliveryError::Transient(detail)
        } else {
            DeliveryError::Permanent(detail)
        }
    }
}

async fn check_response(resp: Result<reqwest::Response, reqwest::Error>) -> Result<(), DeliveryError> {
    let resp = resp.map_err(|e| DeliveryError::Transient(e.to_string()))?;
    let status = resp.status();
    if status.is_success() {
        return Ok(());
    }
    let body = resp.text().await.unwrap_or_default();
    Err(DeliveryError::from_status(status, &body))
}

/// Text messages to callers.
#[async_trait]
pub trait SmsChannel: Send + Sync {
    fn name(&self) -> &str;
    async fn send_sms(&self, to: &str, body: &str) -> Result<(), DeliveryError>;
}

/// Internal notices to the business (e-mail, Telegram).
#[async_trait]
pub trait OperatorChannel: Send + Sync {
    fn name(&self) -> &str;
    async fn send(&self, subject: &str, body: &str) -> Result<(), DeliveryError>;
}

/// Twilio Messages API.
pub struct TwilioSms {
    pub account_sid: String,
    pub auth_token: String,
    pub from: String,
    pub api_base: String,
    pub http_client: reqwest::Client,
}

#[async_trait]
impl SmsChannel for TwilioSms {
    fn name(&self) -> &str {
        "twilio"
    }

    async fn send_sms(&self, to: &str, body: &str) -> Result<(), DeliveryError> {
        let url = format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.api_base, self.account_sid
        );
        let mut form = HashMap::new();
        form.insert("From", self.from.as_str());
        form.insert("To", to);
        form.insert("Body", body);
        let resp = self
            .http_client
            .post(url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&form)
            .send()
            .await;
        check_response(resp).await
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SipgateSmsRequest<'a> {
    sms_id: &'a str,
    recipient: &'a str,
    message: &'a str,
}

/// sipgate `sessions/sms` with a personal access token.
pub struct SipgateSms {
    pub token_id: String,
    pub token: String,
    pub sms_id: String,
    pub api_base: String,
    pub http_client: reqwest::Client,
}

#[async_trait]
impl SmsChannel for SipgateSms {
    fn name(&self) -> &str {
        "sipgate"
    }

    async fn send_sms(&self, to: &str, body: &str) -> Result<(), DeliveryError> {
        let resp = self
            .http_client
            .post(format!("{}/sessions/sms", self.api_base))
            .basic_auth(&self.token_id, Some(&self.token))
            .json(&SipgateSmsRequest {
                sms_id: &self.sms_id,
                recipient: to,
                message: body,
            })
            .send()
            .await;
        check_response(resp).await
    }
}

pub struct EmailChannel {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: String,
    to: Vec<String>,
}

impl EmailChannel {
    pub fn new(settings: &EmailSettings) -> Result<Self, ConfigError> {
        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&settings.smtp_host)
            .map_err(|e| ConfigError::Invalid {
                field: "EMAIL_SMTP_HOST".to_string(),
                message: e.to_string(),
            })?
            .port(settings.smtp_port)
            .credentials(Credentials::new(
                settings.username.clone(),
                settings.password.clone(),
            ))
            .build();
        Ok(Self {
            transport,
            from: settings.from.clone(),
            to: settings.to.clone(),
        })
    }

    pub async fn send_email(&self, subject: &str, body: &str) -> Result<(), DeliveryError> {
        let address = |raw: &str| {
            raw.parse::<Mailbox>()
                .map_err(|e| DeliveryError::Permanent(format!("bad address '{raw}': {e}")))
        };
        let mut builder = Message::builder().from(address(self.from.as_str())?).subject(subject);
        for to in &self.to {
            builder = builder.to(address(to.as_str())?);
        }
        let message = builder
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string())
            .map_err(|e| DeliveryError::Permanent(e.to_string()))?;
        self.transport.send(message).await.map_err(|e| {
            if e.is_permanent() {
                DeliveryError::Permanent(e.to_string())
            } else {
                DeliveryError::Transient(e.to_string())
            }
        })?;
        Ok(())
    }
}

#[async_trait]
impl OperatorChannel for EmailChannel {
    fn name(&self) -> &str {
        "email"
    }

    async fn send(&self, subject: &str, body: &str) -> Result<(), DeliveryError> {
        self.send_email(subject, body).await
    }
}

#[derive(Serialize)]
struct TelegramMessage<'a> {
    chat_id: &'a str,
    text: String,
}

/// One Telegram chat; a comma separated `chat_id` setting yields one channel per chat,
/// each retried on its own.
pub struct TelegramChannel {
    pub bot_token: String,
    pub chat_id: String,
    pub api_base: String,
    pub http_client: reqwest::Client,
}

impl TelegramChannel {
    pub fn per_chat(settings: &TelegramSettings, http_client: &reqwest::Client) -> Vec<Self> {
        settings
            .chat_id
            .split(',')
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(|chat_id| Self {
                bot_token: settings.bot_token.clone(),
                chat_id: chat_id.to_string(),
                api_base: settings.api_base.trim_end_matches('/').to_string(),
                http_client: http_client.clone(),
            })
            .collect()
    }

    pub async fn send_telegram(&self, subject: &str, body: &str) -> Result<(), DeliveryError> {
        let url = format!("{}/bot{}/sendMessage", self.api_base, self.bot_token);
        let resp = self
            .http_client
            .post(&url)
            .json(&TelegramMessage {
                chat_id: &self.chat_id,
                text: format!("{subject}\n\n{body}"),
            })
            .send()
            .await;
        check_response(resp).await?;
        debug!(chat_id = %self.chat_id, "telegram message sent");
        Ok(())
    }
}

#[async_trait]
impl OperatorChannel for TelegramChannel {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn send(&self, subject: &str, body: &str) -> Result<(), DeliveryError> {
        self.send_telegram(subject, body).await
    }
}

/// Outcome of one channel for one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Sent { attempts: u32 },
    Skipped(&'static str),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub customer_sms: Delivery,
    pub operators: Vec<(String, Delivery)>,
}

/// A booking that was just written, with what the messages need to mention.
#[derive(Debug, Clone)]
pub struct BookingEvent {
    pub business_name: String,
    pub business_phone: Option<String>,
    pub record: CreatedRecord,
    pub draft: BookingDraft,
    /// Normalized caller number the booking was stored under
    pub customer_phone: Option<String>,
    pub customer_token: Option<String>,
    pub call_duration: Duration,
}

/// Changes the business (or the customer through the portal) made to an existing booking.
#[derive(Debug, Clone)]
pub enum StatusNotice {
    AppointmentConfirmed(Appointment),
    AppointmentRejected(Appointment),
    AppointmentRescheduled(Appointment),
    InquiryAnswered(Inquiry),
    CancelledByCustomer(Appointment),
    RescheduleRequested(Appointment),
}

impl StatusNotice {
    fn recipient(&self) -> (Option<&str>, PhoneClass) {
        match self {
            StatusNotice::AppointmentConfirmed(a)
            | StatusNotice::AppointmentRejected(a)
            | StatusNotice::AppointmentRescheduled(a)
            | StatusNotice::CancelledByCustomer(a)
            | StatusNotice::RescheduleRequested(a) => (a.customer_phone.as_deref(), a.phone_class),
            StatusNotice::InquiryAnswered(i) => (i.customer_phone.as_deref(), i.phone_class),
        }
    }

    /// Whether the business should hear about it too.
    fn from_customer(&self) -> bool {
        matches!(
            self,
            StatusNotice::CancelledByCustomer(_) | StatusNotice::RescheduleRequested(_)
        )
    }
}

/// Who the messages are sent on behalf of.
#[derive(Debug, Clone)]
pub struct Sender {
    pub business_name: String,
    pub business_phone: Option<String>,
}

pub struct NotificationDispatcher {
    sms: Option<Arc<dyn SmsChannel>>,
    operators: Vec<Arc<dyn OperatorChannel>>,
    web_base_url: Option<String>,
    max_attempts: u32,
    retry_base: Duration,
}

impl NotificationDispatcher {
    pub fn new(
        sms: Option<Arc<dyn SmsChannel>>,
        operators: Vec<Arc<dyn OperatorChannel>>,
        settings: &NotifySettings,
    ) -> Self {
        Self {
            sms,
            operators,
            web_base_url: settings.web_base_url.clone(),
            max_attempts: settings.max_attempts.max(1),
            retry_base: settings.retry_base,
        }
    }

    pub fn from_settings(
        settings: &NotifySettings,
        http_client: &reqwest::Client,
    ) -> Result<Self, ConfigError> {
        let sms: Option<Arc<dyn SmsChannel>> = match &settings.sms {
            Some(SmsSettings::Twilio {
                account_sid,
                auth_token,
                from,
            }) => Some(Arc::new(TwilioSms {
                account_sid: account_sid.clone(),
                auth_token: auth_token.clone(),
                from: from.clone(),
                api_base: "https://api.twilio.com".to_string(),
                http_client: http_client.clone(),
            })),
            Some(SmsSettings::Sipgate {
                token_id,
                token,
                sms_id,
            }) => Some(Arc::new(SipgateSms {
                token_id: token_id.clone(),
                token: token.clone(),
                sms_id: sms_id.clone(),
                api_base: "https://api.sipgate.com/v2".to_string(),
                http_client: http_client.clone(),
            })),
            None => None,
        };
        let mut operators: Vec<Arc<dyn OperatorChannel>> = Vec::new();
        if let Some(email) = &settings.email {
            operators.push(Arc::new(EmailChannel::new(email)?));
        }
        if let Some(telegram) = &settings.telegram {
            for channel in TelegramChannel::per_chat(telegram, http_client) {
                operators.push(Arc::new(channel));
            }
        }
        if sms.is_none() && operators.is_empty() {
            warn!("no notification channels configured, bookings are only visible through the API");
        }
        Ok(Self::new(sms, operators, settings))
    }

    pub fn portal_link(&self, token: &str) -> Option<String> {
        self.web_base_url
            .as_ref()
            .map(|base| format!("{base}/kunde?t={token}"))
    }

    /// Caller confirmation plus operator notice.  Never fails; each channel's
    /// outcome is reported.
    pub async fn booking_created(&self, event: &BookingEvent) -> DispatchReport {
        let customer_sms = match (&event.customer_phone, event.record.phone_class) {
            (None, _) => Delivery::Skipped("no caller number"),
            (Some(_), PhoneClass::Landline) => {
                info!(record_id = event.record.id, "landline caller, callback required instead of SMS");
                Delivery::Skipped("landline")
            }
            (Some(_), PhoneClass::Unknown) => Delivery::Skipped("not a mobile number"),
            (Some(phone), PhoneClass::Mobile) => {
                let body = self.confirmation_text(event);
                self.send_sms(phone, &body).await
            }
        };

        let subject = operator_subject(event);
        let body = operator_body(event);
        let operators = join_all(self.operators.iter().map(|channel| async {
            let outcome = self
                .with_retry(channel.name(), || channel.send(&subject, &body))
                .await;
            (channel.name().to_string(), outcome)
        }))
        .await;
        DispatchReport {
            customer_sms,
            operators,
        }
    }

    pub fn spawn_booking_created(self: &Arc<Self>, event: BookingEvent) -> JoinHandle<DispatchReport> {
        let dispatcher = self.clone();
        tokio::spawn(async move { dispatcher.booking_created(&event).await })
    }

    /// SMS to the customer about a status change, plus an operator notice for
    /// changes the customer made.
    pub async fn status_changed(
        &self,
        notice: &StatusNotice,
        sender: &Sender,
        customer_token: Option<&str>,
    ) -> Delivery {
        if notice.from_customer() {
            let text = status_text(notice, sender, None);
            for channel in &self.operators {
                self.with_retry(channel.name(), || channel.send("Änderung durch Kunden", &text))
                    .await;
            }
        }
        match notice.recipient() {
            (Some(phone), PhoneClass::Mobile) => {
                let link = customer_token.and_then(|t| self.portal_link(t));
                let body = status_text(notice, sender, link.as_deref());
                self.send_sms(phone, &body).await
            }
            (Some(_), PhoneClass::Landline) => Delivery::Skipped("landline"),
            _ => Delivery::Skipped("not a mobile number"),
        }
    }

    pub fn spawn_status_changed(
        self: &Arc<Self>,
        notice: StatusNotice,
        sender: Sender,
        customer_token: Option<String>,
    ) -> JoinHandle<Delivery> {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            dispatcher
                .status_changed(&notice, &sender, customer_token.as_deref())
                .await
        })
    }

    async fn send_sms(&self, to: &str, body: &str) -> Delivery {
        match &self.sms {
            Some(channel) => {
                self.with_retry(channel.name(), || channel.send_sms(to, body))
                    .await
            }
            None => Delivery::Skipped("no SMS provider configured"),
        }
    }

    /// Retries transient failures with doubling backoff.
    async fn with_retry<F, Fut>(&self, channel: &str, mut send: F) -> Delivery
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), DeliveryError>>,
    {
        let mut backoff = self.retry_base;
        for attempt in 1..=self.max_attempts {
            match send().await {
                Ok(()) => {
                    info!(%channel, attempt, "notification delivered");
                    return Delivery::Sent { attempts: attempt };
                }
                Err(DeliveryError::Transient(detail)) if attempt < self.max_attempts => {
                    warn!(%channel, attempt, %detail, "notification failed, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => {
                    let failure = CallError::NotificationDeliveryFailure(e.to_string());
                    error!(%channel, attempt, error = %failure, "notification not delivered");
                    return Delivery::Failed(e.to_string());
                }
            }
        }
        Delivery::Failed("no attempts made".to_string())
    }

    fn confirmation_text(&self, event: &BookingEvent) -> String {
        let greeting = match event.draft.customer_name.as_deref() {
            Some(name) if !name.is_empty() => format!("Guten Tag {name}!"),
            _ => "Guten Tag!".to_string(),
        };
        let what = match event.record.kind {
            RecordKind::Appointment => {
                "Ihre Terminanfrage wurde aufgenommen. Wir melden uns in Kürze mit einer Bestätigung."
            }
            RecordKind::Inquiry => {
                "Ihre Anfrage wurde aufgenommen und wird bearbeitet. Wir melden uns zeitnah bei Ihnen."
            }
        };
        let mut text = format!(
            "{greeting} Vielen Dank für Ihren Anruf bei {}. {what}",
            event.business_name
        );
        if let Some(phone) = &event.business_phone {
            text.push_str(&format!(" Bei Fragen: {phone}"));
        }
        if let Some(link) = event.customer_token.as_deref().and_then(|t| self.portal_link(t)) {
            text.push_str(&format!("\nIhre Buchungen: {link}"));
        }
        text
    }
}

fn operator_subject(event: &BookingEvent) -> String {
    let what = event
        .draft
        .summary
        .clone()
        .or_else(|| event.draft.description.clone())
        .unwrap_or_else(|| "Neuer Anruf".to_string());
    let label = match event.record.kind {
        RecordKind::Appointment => "Neuer Termin",
        RecordKind::Inquiry => "Neue Anfrage",
    };
    if event.record.callback_required {
        format!("RÜCKRUF ERBETEN: {what}")
    } else if event.draft.urgency == Urgency::Emergency {
        format!("NOTFALL: {what}")
    } else {
        format!("{label}: {what}")
    }
}

fn operator_body(event: &BookingEvent) -> String {
    let draft = &event.draft;
    let or_dash = |v: &Option<String>| v.clone().unwrap_or_else(|| "-".to_string());
    let mut lines = vec![
        format!("Betrieb: {}", event.business_name),
        format!("Name: {}", or_dash(&draft.customer_name)),
        format!("Telefon: {}", or_dash(&event.customer_phone)),
        format!("Anliegen: {}", or_dash(&draft.description)),
    ];
    match event.record.kind {
        RecordKind::Appointment => {
            lines.push(format!("Leistung: {}", or_dash(&draft.service_name)));
            lines.push(format!(
                "Wunschtermin: {} {}",
                or_dash(&draft.requested_date),
                draft.requested_time.clone().unwrap_or_default()
            ));
        }
        RecordKind::Inquiry => {
            lines.push(format!("Adresse: {}", or_dash(&draft.customer_address)));
            lines.push(format!("Dringlichkeit: {}", draft.urgency.as_str()));
        }
    }
    lines.push(format!("Gesprächsdauer: {} Sekunden", event.call_duration.as_secs()));
    if let Some(original) = event.record.duplicate_of {
        lines.push(format!("Hinweis: möglicherweise doppelt, siehe #{original}"));
    }
    if event.record.callback_required {
        lines.push(format!(
            "Festnetznummer, bitte unter {} zurückrufen.",
            or_dash(&event.customer_phone)
        ));
    }
    lines.join("\n")
}

fn status_text(notice: &StatusNotice, sender: &Sender, link: Option<&str>) -> String {
    let hello = |name: &Option<String>| match name.as_deref() {
        Some(n) if !n.is_empty() => format!("Guten Tag {n}!"),
        _ => "Guten Tag!".to_string(),
    };
    let business = &sender.business_name;
    let contact = sender
        .business_phone
        .as_deref()
        .map(|p| format!(" Bei Fragen: {p}"))
        .unwrap_or_default();
    let when = |date: &Option<String>, time: &Option<String>| {
        format!(
            "{} {}",
            date.as_deref().unwrap_or("?"),
            time.as_deref().unwrap_or("")
        )
        .trim()
        .to_string()
    };
    let mut text = match notice {
        StatusNotice::AppointmentConfirmed(a) => format!(
            "{} Ihr Termin bei {business} ist bestätigt: {}.{contact}",
            hello(&a.customer_name),
            when(
                &a.confirmed_date.clone().or_else(|| a.requested_date.clone()),
                &a.confirmed_time.clone().or_else(|| a.requested_time.clone())
            )
        ),
        StatusNotice::AppointmentRejected(a) => {
            let reason = a
                .rejection_reason
                .as_deref()
                .map(|r| format!(" Grund: {r}."))
                .unwrap_or_default();
            format!(
                "{} Leider können wir Ihren Terminwunsch bei {business} nicht wahrnehmen.{reason}{contact}",
                hello(&a.customer_name)
            )
        }
        StatusNotice::AppointmentRescheduled(a) => format!(
            "{} Ihr Termin bei {business} wurde verschoben auf {}.{contact}",
            hello(&a.customer_name),
            when(&a.confirmed_date, &a.confirmed_time)
        ),
        StatusNotice::InquiryAnswered(i) => {
            let mut text = format!("{} {business} hat auf Ihre Anfrage reagiert.", hello(&i.customer_name));
            if let Some(response) = &i.response_text {
                text.push_str(&format!(" Nachricht: {response}"));
            }
            if let Some(cost) = &i.estimated_cost {
                text.push_str(&format!(" Geschätzte Kosten: {cost}."));
            }
            if let Some(date) = &i.scheduled_date {
                text.push_str(&format!(" Geplanter Termin: {date}."));
            }
            text.push_str(&contact);
            text
        }
        StatusNotice::CancelledByCustomer(a) => format!(
            "Der Termin von {} am {} bei {business} wurde storniert.{contact}",
            a.customer_name.as_deref().unwrap_or("Kunde"),
            when(&a.requested_date, &a.requested_time)
        ),
        StatusNotice::RescheduleRequested(a) => format!(
            "Der Verschiebungswunsch von {} für den Termin am {} bei {business} wurde übermittelt. \
             Wir melden uns in Kürze.{contact}",
            a.customer_name.as_deref().unwrap_or("Kunde"),
            when(&a.requested_date, &a.requested_time)
        ),
    };
    if let Some(link) = link {
        text.push_str(&format!("\nIhre Buchungen: {link}"));
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extraction::BookingKind;
    use crate::testing::{RecordingOperator, RecordingSms};

    fn settings() -> NotifySettings {
        NotifySettings {
            web_base_url: Some("https://termine.example.de".to_string()),
            max_attempts: 3,
            retry_base: Duration::from_millis(1),
            ..Default::default()
        }
    }

    fn event(phone_class: PhoneClass) -> BookingEvent {
        BookingEvent {
            business_name: "Salon Schnitt".to_string(),
            business_phone: Some("030 1234567".to_string()),
            record: CreatedRecord {
                kind: RecordKind::Appointment,
                id: 7,
                phone_class,
                callback_required: phone_class == PhoneClass::Landline,
                duplicate_of: None,
            },
            draft: BookingDraft {
                kind: Some(BookingKind::Appointment),
                customer_name: Some("Anna Müller".to_string()),
                requested_date: Some("2026-10-20".to_string()),
                requested_time: Some("10:00".to_string()),
                summary: Some("Haarschnitt".to_string()),
                valid: true,
                ..Default::default()
            },
            customer_phone: Some("+491711234567".to_string()),
            customer_token: Some("tok123".to_string()),
            call_duration: Duration::from_secs(95),
        }
    }

    #[tokio::test]
    async fn mobile_caller_gets_sms_with_portal_link() {
        let sms = RecordingSms::new(vec![]);
        let operator = RecordingOperator::new("email");
        let dispatcher = NotificationDispatcher::new(
            Some(sms.clone()),
            vec![operator.clone()],
            &settings(),
        );
        let report = dispatcher.booking_created(&event(PhoneClass::Mobile)).await;
        assert_eq!(report.customer_sms, Delivery::Sent { attempts: 1 });
        assert_eq!(report.operators, vec![("email".to_string(), Delivery::Sent { attempts: 1 })]);

        let sent = sms.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "+491711234567");
        assert!(sent[0].1.starts_with("Guten Tag Anna Müller!"));
        assert!(sent[0].1.contains("https://termine.example.de/kunde?t=tok123"));
        assert!(operator.sent()[0].0.starts_with("Neuer Termin: Haarschnitt"));
    }

    #[tokio::test]
    async fn landline_caller_gets_no_sms_but_operator_is_told_to_call_back() {
        let sms = RecordingSms::new(vec![]);
        let operator = RecordingOperator::new("telegram");
        let dispatcher = NotificationDispatcher::new(
            Some(sms.clone()),
            vec![operator.clone()],
            &settings(),
        );
        let report = dispatcher.booking_created(&event(PhoneClass::Landline)).await;
        assert_eq!(report.customer_sms, Delivery::Skipped("landline"));
        assert!(sms.sent().is_empty());
        let (subject, body) = operator.sent().remove(0);
        assert!(subject.starts_with("RÜCKRUF ERBETEN"));
        assert!(body.contains("zurückrufen"));
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_delivered() {
        let sms = RecordingSms::new(vec![
            Err(DeliveryError::Transient("503".into())),
            Err(DeliveryError::Transient("503".into())),
        ]);
        let dispatcher = NotificationDispatcher::new(Some(sms.clone()), vec![], &settings());
        let report = dispatcher.booking_created(&event(PhoneClass::Mobile)).await;
        assert_eq!(report.customer_sms, Delivery::Sent { attempts: 3 });
        assert_eq!(sms.attempts(), 3);
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let sms = RecordingSms::new(vec![Err(DeliveryError::Permanent("invalid number".into()))]);
        let dispatcher = NotificationDispatcher::new(Some(sms.clone()), vec![], &settings());
        let report = dispatcher.booking_created(&event(PhoneClass::Mobile)).await;
        assert!(matches!(report.customer_sms, Delivery::Failed(_)));
        assert_eq!(sms.attempts(), 1);
    }

    #[tokio::test]
    async fn failing_operator_channel_does_not_stop_the_others() {
        let broken = RecordingOperator::failing("email");
        let working = RecordingOperator::new("telegram");
        let dispatcher = NotificationDispatcher::new(
            None,
            vec![broken.clone(), working.clone()],
            &settings(),
        );
        let report = dispatcher.booking_created(&event(PhoneClass::Mobile)).await;
        assert_eq!(report.customer_sms, Delivery::Skipped("no SMS provider configured"));
        assert!(matches!(report.operators[0].1, Delivery::Failed(_)));
        assert_eq!(report.operators[1].1, Delivery::Sent { attempts: 1 });
        assert_eq!(working.sent().len(), 1);
    }

    #[test]
    fn portal_link_needs_a_base_url() {
        let dispatcher = NotificationDispatcher::new(None, vec![], &NotifySettings::default());
        assert_eq!(dispatcher.portal_link("abc"), None);
        let dispatcher = NotificationDispatcher::new(None, vec![], &settings());
        assert_eq!(
            dispatcher.portal_link("abc").as_deref(),
            Some("https://termine.example.de/kunde?t=abc")
        );
    }

    #[test]
    fn http_statuses_map_to_delivery_errors() {
        assert!(matches!(
            DeliveryError::from_status(reqwest::StatusCode::TOO_MANY_REQUESTS, ""),
            DeliveryError::Transient(_)
        ));
        assert!(matches!(
            DeliveryError::from_status(reqwest::StatusCode::BAD_REQUEST, "invalid 'To'"),
            DeliveryError::Permanent(_)
        ));
    }

    #[test]
    fn every_telegram_chat_is_its_own_channel() {
        let channels = TelegramChannel::per_chat(
            &TelegramSettings {
                bot_token: "123:abc".to_string(),
                chat_id: "111, 222,".to_string(),
                api_base: "https://api.telegram.org/".to_string(),
            },
            &reqwest::Client::new(),
        );
        let chats: Vec<&str> = channels.iter().map(|c| c.chat_id.as_str()).collect();
        assert_eq!(chats, vec!["111", "222"]);
        assert!(channels.iter().all(|c| c.api_base == "https://api.telegram.org"));
    }
}
