use base64::{engine, read, Engine};
use rand::RngCore;
use std::io::{Cursor, Read};
use time::format_description::well_known::Rfc3339;
use time::{Date, Duration as DateDuration, OffsetDateTime, Weekday};

/// Decode a base64 payload (e.g. Google TTS `audioContent`) into `buf`.
pub fn b64_decode_to_buf(enc: String, buf: &mut Vec<u8>) -> std::io::Result<usize> {
    let mut cur = Cursor::new(enc);
    let mut decoder = read::DecoderReader::new(&mut cur, &engine::general_purpose::STANDARD);
    decoder.read_to_end(buf)
}

/// 32 random bytes, URL safe.  Used for business and customer access tokens.
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

pub fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| OffsetDateTime::now_utc().unix_timestamp().to_string())
}

/// Lowercase, strip diacritics and punctuation, collapse whitespace.
/// "Tschüß!" and "tschuss" both fold to "tschuss".
pub fn fold_text(text: &str) -> String {
    let lowered = text.to_lowercase().replace('ß', "ss");
    let stripped: String = lowered
        .chars()
        .map(strip_accent)
        .map(|c| if c.is_alphanumeric() || c == '\'' { c } else { ' ' })
        .collect();
    stripped.split_whitespace().collect::<Vec<&str>>().join(" ")
}

fn strip_accent(c: char) -> char {
    match c {
        'ä' | 'à' | 'á' | 'â' | 'ã' | 'å' => 'a',
        'ö' | 'ò' | 'ó' | 'ô' | 'õ' | 'ø' => 'o',
        'ü' | 'ù' | 'ú' | 'û' => 'u',
        'è' | 'é' | 'ê' | 'ë' => 'e',
        'ì' | 'í' | 'î' | 'ï' => 'i',
        'ç' => 'c',
        'ñ' => 'n',
        other => other,
    }
}

/// Whether any phrase occurs in `text` as whole words, after folding both sides.
pub fn contains_phrase(text: &str, phrases: &[String]) -> bool {
    let haystack = format!(" {} ", fold_text(text));
    phrases.iter().any(|phrase| {
        let needle = fold_text(phrase);
        !needle.is_empty() && haystack.contains(&format!(" {needle} "))
    })
}

const WEEKDAYS: &[(&str, Weekday)] = &[
    ("montag", Weekday::Monday),
    ("dienstag", Weekday::Tuesday),
    ("mittwoch", Weekday::Wednesday),
    ("donnerstag", Weekday::Thursday),
    ("freitag", Weekday::Friday),
    ("samstag", Weekday::Saturday),
    ("sonntag", Weekday::Sunday),
];

/// Resolve German relative day words ("morgen", "Freitag") against the call date.
/// Absolute dates in ISO or `DD.MM.YYYY` form are normalized too.
pub fn resolve_date(raw: &str, today: Date) -> Option<Date> {
    let folded = fold_text(raw);
    let words: Vec<&str> = folded.split(' ').collect();

    if words.contains(&"ubermorgen") || words.contains(&"uebermorgen") {
        return today.checked_add(DateDuration::days(2));
    }
    if words.contains(&"morgen") {
        return today.checked_add(DateDuration::days(1));
    }
    if words.contains(&"heute") {
        return Some(today);
    }
    for (name, weekday) in WEEKDAYS {
        if words.contains(name) {
            let mut day = today.next_day()?;
            while day.weekday() != *weekday {
                day = day.next_day()?;
            }
            return Some(day);
        }
    }
    parse_absolute_date(raw.trim(), today)
}

fn parse_absolute_date(raw: &str, today: Date) -> Option<Date> {
    let iso = time::macros::format_description!("[year]-[month]-[day]");
    if let Ok(date) = Date::parse(raw, &iso) {
        return Some(date);
    }
    let parts: Vec<&str> = raw.trim_end_matches('.').split('.').map(str::trim).collect();
    let (day, month, year) = match parts.as_slice() {
        [d, m, y] => (d.parse::<u8>().ok()?, m.parse::<u8>().ok()?, y.parse::<i32>().ok()?),
        [d, m] => (d.parse::<u8>().ok()?, m.parse::<u8>().ok()?, today.year()),
        _ => return None,
    };
    let year = if year < 100 { 2000 + year } else { year };
    let month = time::Month::try_from(month).ok()?;
    Date::from_calendar_date(year, month, day).ok()
}

pub fn format_date(date: Date) -> String {
    format!(
        "{:04}-{:02}-{:02}",
        date.year(),
        u8::from(date.month()),
        date.day()
    )
}

/// Find a clock time in free text and normalize it to `HH:MM`.
/// Accepts "10 Uhr", "10:30", "10.30 Uhr", "9".
pub fn parse_clock(raw: &str) -> Option<String> {
    let lowered = raw.to_lowercase();
    let chars: Vec<char> = lowered.chars().collect();
    let whole = lowered.trim();
    let mut i = 0;
    while i < chars.len() {
        if !chars[i].is_ascii_digit() || (i > 0 && chars[i - 1].is_ascii_digit()) {
            i += 1;
            continue;
        }
        let start = i;
        while i < chars.len() && chars[i].is_ascii_digit() {
            i += 1;
        }
        if i - start > 2 {
            continue;
        }
        let hour: u32 = chars[start..i].iter().collect::<String>().parse().ok()?;
        let mut minute = None;
        if i + 2 < chars.len()
            && matches!(chars[i], ':' | '.')
            && chars[i + 1].is_ascii_digit()
            && chars[i + 2].is_ascii_digit()
            && chars.get(i + 3).map_or(true, |c| !c.is_ascii_digit())
        {
            minute = chars[i + 1..i + 3].iter().collect::<String>().parse::<u32>().ok();
            i += 3;
        }
        let rest: String = chars[i..].iter().collect();
        let is_clock = minute.is_some()
            || rest.trim_start().starts_with("uhr")
            || chars[start..i].iter().collect::<String>() == whole;
        if is_clock && hour < 24 && minute.map_or(true, |m| m < 60) {
            return Some(format!("{:02}:{:02}", hour, minute.unwrap_or(0)));
        }
    }
    None
}
