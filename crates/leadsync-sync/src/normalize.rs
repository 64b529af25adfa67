//! Per-header cell rules mapping a schemaless scraped record onto the leads tab.
//!
//! Every rule is pure: the same record and header always produce the same cell,
//! except `Date First Added`, whose value the caller supplies once per batch.

use std::sync::LazyLock;

use chrono::{DateTime, TimeZone};
use leadsync_core::{normalize_header, RawRecord};
use regex::Regex;
use serde_json::Value as JsonValue;

use crate::score::lead_score;

pub const UNIQUE_ID_KEYS: &[&str] = &["placeId", "place_id", "id", "placeID"];

const NAME_KEYS: &[&str] = &["title", "name"];
const PHONE_KEYS: &[&str] = &["phone", "phoneNumber"];
const OTHER_PHONE_KEYS: &[&str] = &["phones", "phoneNumbers", "otherPhones"];
const EMAIL_KEYS: &[&str] = &["emails", "email"];
const WEBSITE_KEYS: &[&str] = &["website", "web", "domain"];
const STREET_KEYS: &[&str] = &["street", "streetAddress"];
const CITY_KEYS: &[&str] = &["city", "municipality"];
const STATE_KEYS: &[&str] = &["state", "region", "county"];
const POSTAL_KEYS: &[&str] = &["postalCode", "zip", "addressPostalCode", "zipCode", "postcode"];
const COUNTRY_KEYS: &[&str] = &["countryCode", "addressCountryCode", "country"];
const CATEGORY_KEYS: &[&str] = &["categories", "categoryName", "category", "subTitle"];
const OPENING_HOURS_KEYS: &[&str] = &[
    "openingHours",
    "opening_hours",
    "openingHoursText",
    "openingHoursOpenDays",
];
const GMB_KEYS: &[&str] = &["placeUrl", "googleBusinessUrl", "gmbUrl"];
const MAPS_KEYS: &[&str] = &["url", "googleMapsUrl", "mapsUrl"];
const SEARCH_KEYS: &[&str] = &["searchString", "searchTerm", "keyword"];

const COUNTRY_CODES: &[(&str, &str)] = &[
    ("australia", "AU"),
    ("united states", "US"),
    ("united states of america", "US"),
    ("usa", "US"),
    ("united kingdom", "GB"),
    ("uk", "GB"),
    ("england", "GB"),
    ("canada", "CA"),
    ("germany", "DE"),
    ("france", "FR"),
    ("new zealand", "NZ"),
    ("japan", "JP"),
    ("china", "CN"),
    ("india", "IN"),
    ("singapore", "SG"),
    ("malaysia", "MY"),
    ("indonesia", "ID"),
    ("philippines", "PH"),
    ("vietnam", "VN"),
    ("thailand", "TH"),
    ("italy", "IT"),
    ("spain", "ES"),
    ("netherlands", "NL"),
    ("brazil", "BR"),
    ("mexico", "MX"),
    ("south korea", "KR"),
    ("hong kong", "HK"),
];

static RE_TIME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{1,2})(?::(\d{2}))?\s*(AM|PM)?$").unwrap());
static RE_RANGE_SEP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\s+to\s+|\s*[–—]\s*").unwrap());
static RE_US_ZIP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d{5}(?:-\d{4})?)\b").unwrap());
static RE_UK_POSTCODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b([A-Z]{1,2}\d[A-Z\d]?\s*\d[A-Z]{2})\b").unwrap());
static RE_CA_POSTCODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b([A-Z]\d[A-Z]\s?\d[A-Z]\d)\b").unwrap());
static RE_FOUR_DIGIT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b(\d{4})\b").unwrap());

/// First non-null value among `keys`, in priority order.
pub fn field<'a>(record: &'a RawRecord, keys: &[&str]) -> Option<&'a JsonValue> {
    keys.iter()
        .find_map(|key| record.get(*key).filter(|v| !v.is_null()))
}

/// Cell text for a value; nested structures fall back to their JSON form.
pub fn text(value: Option<&JsonValue>) -> String {
    match value {
        None | Some(JsonValue::Null) => String::new(),
        Some(JsonValue::String(s)) => s.clone(),
        Some(JsonValue::Number(n)) => n.to_string(),
        Some(JsonValue::Bool(b)) => b.to_string(),
        Some(other) => other.to_string(),
    }
}

fn collapse_ws(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn unique_id(record: &RawRecord) -> String {
    text(field(record, UNIQUE_ID_KEYS)).trim().to_string()
}

pub fn digits_only(value: Option<&JsonValue>) -> String {
    text(value).chars().filter(char::is_ascii_digit).collect()
}

fn first_url(value: Option<&JsonValue>) -> String {
    match value {
        Some(JsonValue::String(s)) => s.clone(),
        Some(JsonValue::Array(items)) => items
            .first()
            .and_then(JsonValue::as_str)
            .unwrap_or_default()
            .to_string(),
        _ => String::new(),
    }
}

pub fn normalize_weekday(raw: &str) -> String {
    let trimmed = raw.trim();
    let key = trimmed.trim_end_matches(['.', ':']).to_lowercase();
    let day = match key.as_str() {
        "monday" | "mon" => "Monday",
        "tuesday" | "tue" | "tues" => "Tuesday",
        "wednesday" | "wed" => "Wednesday",
        "thursday" | "thu" | "thur" | "thurs" => "Thursday",
        "friday" | "fri" => "Friday",
        "saturday" | "sat" => "Saturday",
        "sunday" | "sun" => "Sunday",
        _ => return trimmed.to_string(),
    };
    day.to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Meridiem {
    Am,
    Pm,
}

impl Meridiem {
    fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_uppercase().as_str() {
            "AM" => Some(Self::Am),
            "PM" => Some(Self::Pm),
            _ => None,
        }
    }

    fn flipped(self) -> Self {
        match self {
            Self::Am => Self::Pm,
            Self::Pm => Self::Am,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Am => "AM",
            Self::Pm => "PM",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ClockTime {
    hour: u32,
    minute: Option<u32>,
    meridiem: Option<Meridiem>,
}

impl ClockTime {
    fn parse(raw: &str) -> Option<Self> {
        let cleaned = collapse_ws(raw).to_uppercase();
        let caps = RE_TIME.captures(&cleaned)?;
        Some(Self {
            hour: caps.get(1)?.as_str().parse().ok()?,
            minute: caps.get(2).and_then(|m| m.as_str().parse().ok()),
            meridiem: caps.get(3).and_then(|m| Meridiem::parse(m.as_str())),
        })
    }

    fn minutes_since_midnight(self, meridiem: Meridiem) -> u32 {
        let base = self.hour % 12 + if meridiem == Meridiem::Pm { 12 } else { 0 };
        base * 60 + self.minute.unwrap_or(0)
    }

    fn render(self, fallback: Option<Meridiem>) -> String {
        match self.meridiem.or(fallback) {
            None => format!("{}:{:02} AM", self.hour, self.minute.unwrap_or(0)),
            Some(m) => match self.minute {
                Some(minute) if minute != 0 => format!("{}:{:02} {}", self.hour, minute, m.label()),
                _ => format!("{} {}", self.hour, m.label()),
            },
        }
    }
}

/// Normalizes one clock time to 12-hour form; unparseable input is returned trimmed.
pub fn normalize_time(raw: &str) -> String {
    match ClockTime::parse(raw) {
        Some(time) => time.render(None),
        None => raw.trim().to_string(),
    }
}

fn normalize_range(range: &str) -> String {
    let parts: Vec<&str> = RE_RANGE_SEP.split(range).collect();
    if parts.len() != 2 {
        return normalize_time(range);
    }
    let (start_raw, end_raw) = (parts[0].trim(), parts[1].trim());
    let (Some(start), Some(end)) = (ClockTime::parse(start_raw), ClockTime::parse(end_raw)) else {
        return format!("{} to {}", normalize_time(start_raw), normalize_time(end_raw));
    };

    // The start inherits the end's meridiem unless that would put it after the end.
    let start_meridiem = match (start.meridiem, end.meridiem) {
        (Some(m), _) => Some(m),
        (None, Some(m)) => {
            if start.minutes_since_midnight(m) > end.minutes_since_midnight(m) {
                Some(m.flipped())
            } else {
                Some(m)
            }
        }
        (None, None) => None,
    };
    format!("{} to {}", start.render(start_meridiem), end.render(None))
}

/// Normalizes comma-separated hour ranges such as `"9 to 5:30pm"` or `"Closed"`.
pub fn normalize_hours(raw: &str) -> String {
    let cleaned = collapse_ws(raw);
    if cleaned.is_empty() {
        return String::new();
    }
    if cleaned.eq_ignore_ascii_case("closed") {
        return "Closed".to_string();
    }
    cleaned
        .split(',')
        .map(str::trim)
        .filter(|range| !range.is_empty())
        .map(normalize_range)
        .collect::<Vec<_>>()
        .join(", ")
}

fn first_text(obj: &serde_json::Map<String, JsonValue>, keys: &[&str]) -> String {
    text(keys.iter().find_map(|k| obj.get(*k).filter(|v| !v.is_null())))
}

fn day_line(entry: &JsonValue) -> String {
    let JsonValue::Object(obj) = entry else {
        return text(Some(entry));
    };
    let day = first_text(obj, &["day", "weekday", "name"]);
    if day.trim().is_empty() {
        return text(Some(entry));
    }
    let hours = normalize_hours(&first_text(obj, &["hours", "open", "time"]));
    let hours = if hours.is_empty() { "Closed".to_string() } else { hours };
    format!("{} - {}", normalize_weekday(&day), hours)
}

pub fn opening_hours(record: &RawRecord) -> String {
    let Some(value) = field(record, OPENING_HOURS_KEYS) else {
        return String::new();
    };
    match value {
        JsonValue::String(s) => s.trim().to_string(),
        JsonValue::Array(entries) => entries
            .iter()
            .map(day_line)
            .filter(|line| !line.is_empty())
            .collect::<Vec<_>>()
            .join("\n"),
        JsonValue::Object(obj) => match obj.get("weekdayText") {
            Some(JsonValue::Array(lines)) => lines
                .iter()
                .map(|line| text(Some(line)))
                .filter(|line| !line.is_empty())
                .collect::<Vec<_>>()
                .join("\n"),
            _ => text(Some(value)),
        },
        other => text(Some(other)),
    }
}

/// Comma-separated segments of a free-text address.
fn address_segments(record: &RawRecord) -> Vec<String> {
    match record.get("address") {
        Some(JsonValue::String(s)) => s
            .split(',')
            .map(str::trim)
            .filter(|seg| !seg.is_empty())
            .map(ToString::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

fn nested_address<'a>(record: &'a RawRecord, keys: &[&str]) -> Option<&'a JsonValue> {
    match record.get("address") {
        Some(JsonValue::Object(addr)) => keys
            .iter()
            .find_map(|k| addr.get(*k).filter(|v| !v.is_null())),
        _ => None,
    }
}

/// Top-level aliases first, then the structured address object.
fn address_part(record: &RawRecord, top: &[&str], nested: &[&str]) -> Option<String> {
    [field(record, top), nested_address(record, nested)]
        .into_iter()
        .map(|value| text(value).trim().to_string())
        .find(|value| !value.is_empty())
}

fn postal_in(segment: &str) -> Option<String> {
    [&*RE_US_ZIP, &*RE_UK_POSTCODE, &*RE_CA_POSTCODE, &*RE_FOUR_DIGIT]
        .iter()
        .find_map(|re| re.captures(segment))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().split_whitespace().collect::<String>().to_uppercase())
}

fn postal_from_segments(segments: &[String]) -> Option<String> {
    let joined = segments.join(", ");
    if let Some(m) = RE_US_ZIP.captures(&joined).and_then(|caps| caps.get(1)) {
        return Some(m.as_str().to_string());
    }
    let tail = if segments.len() > 1 { &segments[1..] } else { segments };
    tail.iter().rev().find_map(|seg| postal_in(seg))
}

pub fn postal_code(record: &RawRecord) -> String {
    address_part(record, POSTAL_KEYS, &["postalCode", "zip", "postcode", "zipCode"])
        .or_else(|| postal_from_segments(&address_segments(record)))
        .unwrap_or_default()
}

fn country_lookup(name: &str) -> Option<&'static str> {
    let key = collapse_ws(name).to_lowercase();
    COUNTRY_CODES
        .iter()
        .find(|(country, _)| *country == key)
        .map(|(_, code)| *code)
}

/// ISO code for a country name or code: table lookup, else the first two letters uppercased.
pub fn country_code(raw: &str) -> String {
    let trimmed = raw.trim();
    if let Some(code) = country_lookup(trimmed) {
        return code.to_string();
    }
    trimmed
        .chars()
        .filter(|c| c.is_alphabetic())
        .take(2)
        .collect::<String>()
        .to_uppercase()
}

pub fn address_country(record: &RawRecord) -> String {
    address_part(record, COUNTRY_KEYS, &["countryCode", "country"])
        .or_else(|| address_segments(record).last().cloned())
        .map(|raw| country_code(&raw))
        .unwrap_or_default()
}

pub fn address_street(record: &RawRecord) -> String {
    address_part(record, STREET_KEYS, &["street", "streetAddress", "address", "line1"])
        .or_else(|| address_segments(record).into_iter().next())
        .unwrap_or_default()
}

pub fn address_city(record: &RawRecord) -> String {
    address_part(record, CITY_KEYS, &["city", "municipality", "locality"])
        .or_else(|| {
            let segments = address_segments(record);
            (segments.len() >= 3).then(|| strip_postal(&segments[1]))
        })
        .unwrap_or_default()
}

/// Drops a trailing postal code from an address segment (`NSW 2000` -> `NSW`).
fn strip_postal(segment: &str) -> String {
    let Some(code) = postal_in(segment) else {
        return segment.to_string();
    };
    let words: Vec<&str> = segment.split_whitespace().collect();
    let mut keep = words.len();
    let mut tail = String::new();
    while keep > 0 {
        tail = format!("{}{}", words[keep - 1].to_uppercase(), tail);
        keep -= 1;
        if tail == code {
            return words[..keep].join(" ");
        }
        if !code.ends_with(&tail) {
            break;
        }
    }
    segment.to_string()
}

fn state_from_segments(segments: &[String]) -> Option<String> {
    let candidate = match segments.len() {
        0..=2 => return None,
        3 if country_lookup(&segments[2]).is_none() => &segments[2],
        3 => return None,
        n => &segments[n - 2],
    };
    let state = strip_postal(candidate);
    (!state.is_empty()).then_some(state)
}

pub fn address_state(record: &RawRecord) -> String {
    address_part(record, STATE_KEYS, &["state", "region", "county"])
        .or_else(|| state_from_segments(&address_segments(record)))
        .unwrap_or_default()
}

/// Category names plus every `additionalInfo` option flagged true, deduplicated in order.
pub fn list_of_services(record: &RawRecord) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut push = |label: String| {
        let label = label.trim().to_string();
        if !label.is_empty() && !parts.contains(&label) {
            parts.push(label);
        }
    };

    match field(record, CATEGORY_KEYS) {
        Some(JsonValue::Array(items)) => {
            for item in items {
                match item {
                    JsonValue::Object(obj) if obj.contains_key("name") => push(text(obj.get("name"))),
                    other => push(text(Some(other))),
                }
            }
        }
        other => push(text(other)),
    }

    if let Some(JsonValue::Object(info)) = record.get("additionalInfo") {
        for value in info.values() {
            let JsonValue::Array(entries) = value else {
                continue;
            };
            for entry in entries {
                let JsonValue::Object(options) = entry else {
                    continue;
                };
                for (option, flag) in options {
                    let enabled = match flag {
                        JsonValue::Bool(b) => *b,
                        JsonValue::String(s) => s == "true",
                        JsonValue::Number(n) => n.as_f64() == Some(1.0),
                        _ => false,
                    };
                    if enabled {
                        push(option.clone());
                    }
                }
            }
        }
    }

    parts.join(" | ")
}

/// Digits of each phone entry; array values are normalized per entry and pipe-joined.
fn phones(value: Option<&JsonValue>) -> String {
    match value {
        Some(JsonValue::Array(items)) => items
            .iter()
            .map(|item| digits_only(Some(item)))
            .filter(|phone| !phone.is_empty())
            .collect::<Vec<_>>()
            .join(" | "),
        other => digits_only(other),
    }
}

fn primary_email(record: &RawRecord) -> String {
    match field(record, EMAIL_KEYS) {
        Some(JsonValue::Array(items)) => text(items.first()),
        other => text(other),
    }
}

fn other_emails(record: &RawRecord) -> String {
    match record.get("emails") {
        Some(JsonValue::Array(items)) => items
            .iter()
            .skip(1)
            .map(|item| text(Some(item)))
            .filter(|email| !email.is_empty())
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

/// `DD/MM/YYYY, h:mm:ss am` in the timestamp's own offset.
pub fn first_seen_label<Tz>(at: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    at.format("%d/%m/%Y, %-I:%M:%S %P").to_string()
}

/// Destination column kinds, resolved once per header row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeadColumn {
    UniqueId,
    BusinessName,
    OpeningHours,
    Comments,
    PhoneNumber,
    OtherPhones,
    Email,
    OtherEmails,
    Website,
    Street,
    City,
    State,
    PostalCode,
    CountryCode,
    Services,
    Social(&'static [&'static str]),
    GoogleBusinessUrl,
    GoogleMapsUrl,
    SearchWord,
    FirstSeen,
    LeadScore,
    Unknown,
}

impl LeadColumn {
    pub fn from_header(header: &str) -> Self {
        match normalize_header(header).as_str() {
            "unique id" => Self::UniqueId,
            "business name" => Self::BusinessName,
            "opening hours" => Self::OpeningHours,
            "comments" => Self::Comments,
            "phone number" => Self::PhoneNumber,
            "other phones" => Self::OtherPhones,
            "email" => Self::Email,
            "other emails" => Self::OtherEmails,
            "website url" => Self::Website,
            "address street" => Self::Street,
            "address city" => Self::City,
            "address state" => Self::State,
            "address postcode" | "address postal code" => Self::PostalCode,
            "address country" | "address country code" => Self::CountryCode,
            "list of services" => Self::Services,
            "facebook url" => Self::Social(&["facebook", "facebooks"]),
            "linkedin url" => Self::Social(&["linkedIn", "linkedIns", "linkedin", "linkedins"]),
            "twitter url" => Self::Social(&["twitter", "twitters"]),
            "instagram url" => Self::Social(&["instagram", "instagrams"]),
            "youtube url" => Self::Social(&["youtube", "youtubes"]),
            "tiktok url" => Self::Social(&["tiktok", "tiktoks"]),
            "pinterest url" => Self::Social(&["pinterest", "pinterests"]),
            "discord url" => Self::Social(&["discord", "discords"]),
            "google my business url" => Self::GoogleBusinessUrl,
            "google maps url" => Self::GoogleMapsUrl,
            "search word" => Self::SearchWord,
            "date first added" => Self::FirstSeen,
            "ai analysis" => Self::LeadScore,
            _ => Self::Unknown,
        }
    }

    pub fn cell(self, record: &RawRecord, unique_id: &str, first_seen: &str) -> String {
        match self {
            Self::UniqueId => unique_id.to_string(),
            Self::BusinessName => text(field(record, NAME_KEYS)),
            Self::OpeningHours => opening_hours(record),
            Self::Comments | Self::Unknown => String::new(),
            Self::PhoneNumber => phones(field(record, PHONE_KEYS)),
            Self::OtherPhones => phones(field(record, OTHER_PHONE_KEYS)),
            Self::Email => primary_email(record),
            Self::OtherEmails => other_emails(record),
            Self::Website => text(field(record, WEBSITE_KEYS)),
            Self::Street => address_street(record),
            Self::City => address_city(record),
            Self::State => address_state(record),
            Self::PostalCode => postal_code(record),
            Self::CountryCode => address_country(record),
            Self::Services => list_of_services(record),
            Self::Social(keys) => first_url(field(record, keys)),
            Self::GoogleBusinessUrl => text(field(record, GMB_KEYS)),
            Self::GoogleMapsUrl => text(field(record, MAPS_KEYS)),
            Self::SearchWord => text(field(record, SEARCH_KEYS)),
            Self::FirstSeen => first_seen.to_string(),
            Self::LeadScore => lead_score(record).to_string(),
        }
    }
}
