use crate::error::ConfigError;
use crate::types::BusinessMode;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

/// Industries that book time slots; everything else takes work orders.
const APPOINTMENT_INDUSTRIES: &[&str] = &[
    "friseur",
    "kosmetik",
    "beauty",
    "massage",
    "nagelstudio",
    "barbershop",
    "physiotherapie",
    "heilpraktiker",
    "tattoo",
    "piercing",
    "spa",
    "wellness",
    "gastronomie",
    "restaurant",
    "hotel",
    "cafe",
    "bistro",
    "bar",
    "pension",
];

const DEFAULT_GREETING: &str = "Guten Tag, Sie sind verbunden mit {company}. Wie kann ich Ihnen helfen?";

pub fn mode_for_industry(industry: &str) -> BusinessMode {
    if APPOINTMENT_INDUSTRIES.contains(&industry.trim().to_lowercase().as_str()) {
        BusinessMode::Appointment
    } else {
        BusinessMode::Inquiry
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaqEntry {
    pub question: String,
    pub answer: String,
}

/// Grounding context for one business, read from `<PROFILES_DIR>/<name>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusinessProfile {
    #[serde(alias = "company_name")]
    pub name: String,
    #[serde(default)]
    pub industry: Option<String>,
    #[serde(default)]
    pub mode: Option<BusinessMode>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub opening_hours: BTreeMap<String, String>,
    #[serde(default)]
    pub services: Vec<String>,
    #[serde(default)]
    pub important_info: Vec<String>,
    #[serde(default, alias = "behavior_rules")]
    pub directives: Vec<String>,
    #[serde(default)]
    pub faq: Vec<FaqEntry>,
    #[serde(default)]
    pub custom_instructions: Option<String>,
    /// `{company}` is replaced with the business name
    #[serde(default)]
    pub greeting: Option<String>,
    #[serde(default)]
    pub voice: Option<String>,
}

impl BusinessProfile {
    pub async fn load(dir: &Path, name: &str) -> Result<Self, ConfigError> {
        let path = dir.join(format!("{name}.json"));
        let profile_err = |message: String| ConfigError::Profile {
            path: path.display().to_string(),
            message,
        };
        let raw = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| profile_err(e.to_string()))?;
        let profile: BusinessProfile =
            serde_json::from_str(&raw).map_err(|e| profile_err(e.to_string()))?;
        if profile.name.trim().is_empty() {
            return Err(profile_err("company name is empty".to_string()));
        }
        info!(business = %profile.name, mode = profile.mode().as_str(), "loaded business profile");
        Ok(profile)
    }

    /// Explicit mode, or one guessed from the industry.
    pub fn mode(&self) -> BusinessMode {
        if let Some(mode) = self.mode {
            return mode;
        }
        self.industry
            .as_deref()
            .map(mode_for_industry)
            .unwrap_or(BusinessMode::Inquiry)
    }

    pub fn greeting(&self) -> String {
        self.greeting
            .as_deref()
            .unwrap_or(DEFAULT_GREETING)
            .replace("{company}", &self.name)
    }

    pub fn system_prompt(&self) -> String {
        let or_unknown = |v: &Option<String>| v.clone().unwrap_or_else(|| "Nicht angegeben".to_string());
        let mut prompt = format!(
            "Du bist der freundliche Telefonassistent von {name}.\n\n\
             UNTERNEHMEN: {name}\n\
             BRANCHE: {industry}\n\
             ADRESSE: {address}\n\
             TELEFON: {phone}\n\
             EMAIL: {email}\n\n\
             ÖFFNUNGSZEITEN:\n{hours}\n\n\
             DIENSTLEISTUNGEN:\n{services}\n\n\
             WICHTIGE INFORMATIONEN:\n{info}\n\n\
             VERHALTENSREGELN:\n{rules}\n\n\
             HÄUFIGE FRAGEN:\n{faq}\n\n",
            name = self.name,
            industry = self.industry.clone().unwrap_or_else(|| "Allgemein".to_string()),
            address = or_unknown(&self.address),
            phone = or_unknown(&self.phone),
            email = or_unknown(&self.email),
            hours = format_hours(&self.opening_hours),
            services = format_list(&self.services),
            info = format_list(&self.important_info),
            rules = format_list(&self.directives),
            faq = format_faq(&self.faq),
        );
        prompt.push_str(match self.mode() {
            BusinessMode::Appointment => {
                "ABLAUF: Finde heraus, welche Leistung der Anrufer wünscht, frage nach dem Namen \
                 und nach einem Wunschtermin. Fasse am Ende Name, Leistung und Termin zusammen \
                 und lass es bestätigen.\n\n"
            }
            BusinessMode::Inquiry => {
                "ABLAUF: Lass dir das Anliegen beschreiben, frage nach dem Namen, der Adresse und \
                 wann es dem Anrufer passt. Fasse am Ende alles zusammen und lass es bestätigen.\n\n"
            }
        });
        prompt.push_str(
            "REGELN:\n\
             - Deine Antworten werden am Telefon vorgelesen: höchstens ein kurzer Satz.\n\
             - Stelle immer nur eine Frage auf einmal.\n\
             - Antworte nur auf Deutsch, ohne Emojis und ohne Aufzählungen.\n\
             - Erfinde keine Daten. Die Telefonnummer des Anrufers ist bereits bekannt.\n\
             - Wenn alles erledigt ist, verabschiede dich mit \"Auf Wiederhören\".\n",
        );
        if let Some(extra) = &self.custom_instructions {
            prompt.push_str(&format!("\nZUSÄTZLICHE ANWEISUNGEN:\n{extra}\n"));
        }
        prompt
    }
}

fn format_hours(hours: &BTreeMap<String, String>) -> String {
    if hours.is_empty() {
        return "  Nicht angegeben".to_string();
    }
    hours
        .iter()
        .map(|(day, time)| format!("  {day}: {time}"))
        .collect::<Vec<String>>()
        .join("\n")
}

fn format_list(items: &[String]) -> String {
    if items.is_empty() {
        return "  Keine angegeben".to_string();
    }
    items
        .iter()
        .map(|item| format!("  - {item}"))
        .collect::<Vec<String>>()
        .join("\n")
}

fn format_faq(faq: &[FaqEntry]) -> String {
    if faq.is_empty() {
        return "  Keine angegeben".to_string();
    }
    faq.iter()
        .map(|entry| format!("  F: {}\n  A: {}", entry.question, entry.answer))
        .collect::<Vec<String>>()
        .join("\n")
}
