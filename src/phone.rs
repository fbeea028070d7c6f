use serde::{Deserialize, Serialize};

/// German mobile ranges (015x, 016x, 017x) in national and international notation.
pub const DEFAULT_MOBILE_PREFIXES: &[&str] = &[
    "015", "016", "017", "+4915", "+4916", "+4917", "004915", "004916", "004917",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum PhoneClass {
    Mobile,
    Landline,
    Unknown,
}

impl PhoneClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhoneClass::Mobile => "mobile",
            PhoneClass::Landline => "landline",
            PhoneClass::Unknown => "unknown",
        }
    }
}

/// Prefix rules deciding whether a number can receive SMS.
#[derive(Debug, Clone)]
pub struct PhoneRules {
    pub mobile_prefixes: Vec<String>,
}

impl Default for PhoneRules {
    fn default() -> Self {
        Self {
            mobile_prefixes: DEFAULT_MOBILE_PREFIXES.iter().map(|p| p.to_string()).collect(),
        }
    }
}

impl PhoneRules {
    pub fn classify(&self, raw: &str) -> PhoneClass {
        let clean = normalize_number(raw);
        if !is_contactable(&clean) {
            return PhoneClass::Unknown;
        }
        if self.mobile_prefixes.iter().any(|p| clean.starts_with(p.as_str())) {
            PhoneClass::Mobile
        } else {
            PhoneClass::Landline
        }
    }
}

/// Strip the separators people and PBXes put into numbers.
pub fn normalize_number(raw: &str) -> String {
    raw.trim()
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '/' | '(' | ')' | '.'))
        .collect()
}

/// A number we could actually call or text back.
pub fn is_contactable(number: &str) -> bool {
    let digits = number.chars().filter(|c| c.is_ascii_digit()).count();
    digits >= 3
        && number
            .chars()
            .enumerate()
            .all(|(i, c)| c.is_ascii_digit() || (i == 0 && c == '+'))
}
