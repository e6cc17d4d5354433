//! Field extraction and validation. Pure functions over text read from the page.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

static ADDRESS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<street>.+?),\s*(?P<city>[^,]+?),\s*(?P<region>[A-Za-z]{2})\.?(?:\s+(?P<postal>\d{5}(?:-\d{4})?))?$")
        .expect("address regex")
});
static PRICE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\$?\s*(?P<num>\d[\d,]*(?:\.\d+)?)\s*(?P<unit>[km](?:il+ion)?)?\b")
        .expect("price regex")
});
static BEDS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?P<n>\d+(?:\.\d+)?)\s*(?:bds?|beds?|bedrooms?|br)\b").expect("beds regex")
});
static BATHS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?P<n>\d+(?:\.\d+)?)\s*(?:ba|baths?|bathrooms?)\b").expect("baths regex")
});
static SQFT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?P<n>\d[\d,]*)\s*(?:sq\.?\s*ft\.?|sqft|square\s+feet)").expect("sqft regex")
});
static PHONE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:\+?1[\s.-]?)?\(?(?P<a>\d{3})\)?[\s.-]?(?P<b>\d{3})[\s.-]?(?P<c>\d{4})\b")
        .expect("phone regex")
});
static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)[a-z0-9._%+-]+@[a-z0-9.-]+\.[a-z]{2,}").expect("email regex")
});
static LISTING_AGENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:listing agent|listed by|list agent)\s*[:\-]?\s*")
        .expect("listing agent regex")
});
static BROKERAGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:listing office|listing broker(?:age)?|brokerage|courtesy of)\s*[:\-]?\s*(?P<b>[^\n|]+)")
        .expect("brokerage regex")
});
static NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<name>[A-Z][A-Za-z.'-]+(?:\s+[A-Z][A-Za-z.'-]+){1,3})").expect("name regex")
});

/// How far past a "listing agent" label its contact details are searched for.
const AGENT_WINDOW_CHARS: usize = 240;

/// Contact hints present inline on a summary card.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentHints {
    pub name: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub brokerage: Option<String>,
}

/// One row as read from the rendered list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawListingCard {
    pub address_lines: Vec<String>,
    pub price_text: Option<String>,
    #[serde(default)]
    pub stats: Vec<String>,
    #[serde(default)]
    pub agent: AgentHints,
    /// Link or element id used to open the detail view.
    pub detail_ref: Option<String>,
}

impl RawListingCard {
    /// Deduplication key: the normalized, case-folded address.
    pub fn key(&self) -> String {
        address_key(&self.address_lines)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub name: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub brokerage: Option<String>,
}

impl AgentInfo {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.phone.is_none() && self.email.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedAddress {
    pub street: String,
    pub city: String,
    pub region: String,
    pub postal: Option<String>,
}

impl ParsedAddress {
    pub fn full(&self) -> String {
        match &self.postal {
            Some(postal) => format!("{}, {}, {} {}", self.street, self.city, self.region, postal),
            None => format!("{}, {}, {}", self.street, self.city, self.region),
        }
    }
}

/// The persisted unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedListing {
    pub address: ParsedAddress,
    pub full_address: String,
    pub price: i64,
    pub beds: Option<f64>,
    pub baths: Option<f64>,
    pub sqft: Option<i64>,
    pub agent: AgentInfo,
    pub source: String,
    pub region: String,
    pub harvested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PriceRange {
    pub floor: Option<i64>,
    pub ceiling: Option<i64>,
}

impl PriceRange {
    pub fn contains(&self, price: i64) -> bool {
        self.floor.is_none_or(|f| price >= f) && self.ceiling.is_none_or(|c| price <= c)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    MissingAddress,
    UnparseablePrice(String),
    /// The card belongs to another region: a stale view leaking through.
    RegionMismatch { expected: String, found: String },
    PriceOutOfRange(i64),
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::MissingAddress => write!(f, "address could not be parsed"),
            Rejection::UnparseablePrice(t) => write!(f, "price could not be parsed: {t:?}"),
            Rejection::RegionMismatch { expected, found } => {
                write!(f, "region {found} does not match searched region {expected}")
            }
            Rejection::PriceOutOfRange(p) => write!(f, "price {p} outside accepted range"),
        }
    }
}

pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn address_key(lines: &[String]) -> String {
    lines
        .iter()
        .map(|l| normalize_whitespace(l))
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join(", ")
        .to_lowercase()
}

pub fn parse_address(lines: &[String]) -> Option<ParsedAddress> {
    let joined = lines
        .iter()
        .map(|l| normalize_whitespace(l))
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join(", ");
    let caps = ADDRESS_RE.captures(&joined)?;
    Some(ParsedAddress {
        street: caps["street"].trim().to_string(),
        city: caps["city"].trim().to_string(),
        region: caps["region"].to_uppercase(),
        postal: caps.name("postal").map(|m| m.as_str().to_string()),
    })
}

/// `"$245,000"`, `"$1.2M"`, `"950K"`, `"Est. $300,000+"`. Ranges take the lower bound.
pub fn parse_price(text: &str) -> Option<i64> {
    let caps = PRICE_RE.captures(text)?;
    let number: f64 = caps["num"].replace(',', "").parse().ok()?;
    let multiplier = match caps.name("unit").map(|u| u.as_str().to_lowercase()) {
        Some(unit) if unit.starts_with('k') => 1_000.0,
        Some(unit) if unit.starts_with('m') => 1_000_000.0,
        _ => 1.0,
    };
    let price = (number * multiplier).round() as i64;
    (price > 0).then_some(price)
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct QuickStats {
    pub beds: Option<f64>,
    pub baths: Option<f64>,
    pub sqft: Option<i64>,
}

pub fn parse_stats(stats: &[String]) -> QuickStats {
    let joined = stats.join(" | ");
    let beds = BEDS_RE
        .captures(&joined)
        .and_then(|c| c["n"].parse().ok())
        .or_else(|| joined.to_lowercase().contains("studio").then_some(0.0));
    let baths = BATHS_RE.captures(&joined).and_then(|c| c["n"].parse().ok());
    let sqft = SQFT_RE
        .captures(&joined)
        .and_then(|c| c["n"].replace(',', "").parse().ok());
    QuickStats { beds, baths, sqft }
}

pub fn normalize_phone(text: &str) -> Option<String> {
    let caps = PHONE_RE.captures(text)?;
    Some(format!("{}-{}-{}", &caps["a"], &caps["b"], &caps["c"]))
}

pub fn find_email(text: &str) -> Option<String> {
    EMAIL_RE.find(text).map(|m| m.as_str().to_lowercase())
}

/// Checks and normalizes a card. Agent fields are left empty for the fallback chain.
pub fn validate(
    card: &RawListingCard,
    expected_region: &str,
    range: &PriceRange,
    source: &str,
    now: DateTime<Utc>,
) -> Result<NormalizedListing, Rejection> {
    let address = parse_address(&card.address_lines).ok_or(Rejection::MissingAddress)?;

    if !address.region.eq_ignore_ascii_case(expected_region) {
        return Err(Rejection::RegionMismatch {
            expected: expected_region.to_uppercase(),
            found: address.region.clone(),
        });
    }

    let price_text = card.price_text.clone().unwrap_or_default();
    let price =
        parse_price(&price_text).ok_or_else(|| Rejection::UnparseablePrice(price_text.clone()))?;
    if !range.contains(price) {
        return Err(Rejection::PriceOutOfRange(price));
    }

    let stats = parse_stats(&card.stats);
    Ok(NormalizedListing {
        full_address: address.full(),
        region: address.region.clone(),
        address,
        price,
        beds: stats.beds,
        baths: stats.baths,
        sqft: stats.sqft,
        agent: AgentInfo::default(),
        source: source.to_string(),
        harvested_at: now,
    })
}

/// Stage (a): inline contact links or labels on the summary card.
pub fn agent_from_card(hints: &AgentHints) -> Option<AgentInfo> {
    let agent = AgentInfo {
        name: hints.name.as_deref().map(normalize_whitespace).filter(|s| !s.is_empty()),
        phone: hints.phone.as_deref().and_then(normalize_phone),
        email: hints.email.as_deref().and_then(find_email),
        brokerage: hints
            .brokerage
            .as_deref()
            .map(normalize_whitespace)
            .filter(|s| !s.is_empty()),
    };
    (!agent.is_empty()).then_some(agent)
}

/// Stage (b): explicitly labeled "listing agent" fields in the detail view.
///
/// Only text following the label is searched, so contacts for other parties
/// on a shared panel are not picked up.
pub fn agent_from_detail_text(text: &str) -> Option<AgentInfo> {
    let label = LISTING_AGENT_RE.find(text)?;
    let tail = &text[label.end()..];
    let window: String = tail.chars().take(AGENT_WINDOW_CHARS).collect();

    let first_line = window.trim_start().lines().next().unwrap_or_default();
    let name = NAME_RE
        .captures(first_line)
        .map(|c| c["name"].trim().to_string());
    let brokerage = BROKERAGE_RE
        .captures(text)
        .map(|c| normalize_whitespace(&c["b"]))
        .filter(|b| !b.is_empty());
    let agent = AgentInfo {
        name,
        phone: normalize_phone(&window),
        email: find_email(&window),
        brokerage,
    };
    (!agent.is_empty()).then_some(agent)
}

/// Stage (c): any contact details at all.
pub fn agent_from_contact_scan(text: &str) -> Option<AgentInfo> {
    let agent = AgentInfo {
        name: None,
        phone: normalize_phone(text),
        email: find_email(text),
        brokerage: None,
    };
    (!agent.is_empty()).then_some(agent)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn card(lines: &[&str], price: &str) -> RawListingCard {
        RawListingCard {
            address_lines: lines.iter().map(|s| s.to_string()).collect(),
            price_text: Some(price.to_string()),
            stats: vec!["3 bds".into(), "2 ba".into(), "1,850 sqft".into()],
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_price_variants() {
        assert_eq!(parse_price("$245,000"), Some(245_000));
        assert_eq!(parse_price("$1.2M"), Some(1_200_000));
        assert_eq!(parse_price("950K"), Some(950_000));
        assert_eq!(parse_price("Est. $300,000+"), Some(300_000));
        assert_eq!(parse_price("$200,000 - $250,000"), Some(200_000));
        assert_eq!(parse_price("Contact agent"), None);
    }

    #[test]
    fn test_parse_stats() {
        let stats = parse_stats(&["3 bds".into(), "2.5 ba".into(), "1,850 sqft".into()]);
        assert_eq!(stats.beds, Some(3.0));
        assert_eq!(stats.baths, Some(2.5));
        assert_eq!(stats.sqft, Some(1850));

        let studio = parse_stats(&["Studio".into(), "1 bath".into()]);
        assert_eq!(studio.beds, Some(0.0));
        assert_eq!(studio.baths, Some(1.0));
        assert_eq!(studio.sqft, None);
    }

    #[test]
    fn test_parse_address_two_lines() {
        let parsed = parse_address(&["12 Elm St".into(), "Albany, NY 12203".into()]).unwrap();
        assert_eq!(parsed.street, "12 Elm St");
        assert_eq!(parsed.city, "Albany");
        assert_eq!(parsed.region, "NY");
        assert_eq!(parsed.postal.as_deref(), Some("12203"));
        assert_eq!(parsed.full(), "12 Elm St, Albany, NY 12203");
    }

    #[test]
    fn test_address_key_is_case_and_space_insensitive() {
        let a = address_key(&["12  Elm St".into(), "Albany, NY 12203".into()]);
        let b = address_key(&["12 ELM ST".into(), " albany,  ny 12203".into()]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_validate_accepts_matching_region() {
        let listing = validate(
            &card(&["12 Elm St", "Albany, NY 12203"], "$250,000"),
            "ny",
            &PriceRange::default(),
            "primary",
            Utc::now(),
        )
        .unwrap();
        assert_eq!(listing.price, 250_000);
        assert_eq!(listing.region, "NY");
        assert_eq!(listing.beds, Some(3.0));
        assert!(listing.agent.is_empty());
    }

    #[test]
    fn test_validate_rejects_region_mismatch() {
        let result = validate(
            &card(&["9 Palm Dr", "Fresno, CA 93650"], "$250,000"),
            "NY",
            &PriceRange::default(),
            "primary",
            Utc::now(),
        );
        assert_eq!(
            result,
            Err(Rejection::RegionMismatch {
                expected: "NY".into(),
                found: "CA".into()
            })
        );
    }

    #[test]
    fn test_validate_price_gate() {
        let range = PriceRange {
            floor: Some(100_000),
            ceiling: Some(200_000),
        };
        let result = validate(
            &card(&["12 Elm St", "Albany, NY 12203"], "$250,000"),
            "NY",
            &range,
            "primary",
            Utc::now(),
        );
        assert_eq!(result, Err(Rejection::PriceOutOfRange(250_000)));
    }

    #[test]
    fn test_agent_from_card_requires_contact() {
        assert_eq!(agent_from_card(&AgentHints::default()), None);
        let agent = agent_from_card(&AgentHints {
            name: Some(" Jane  Doe ".into()),
            phone: Some("(518) 555-0101".into()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(agent.name.as_deref(), Some("Jane Doe"));
        assert_eq!(agent.phone.as_deref(), Some("518-555-0101"));
    }

    #[test]
    fn test_agent_from_detail_text_ignores_other_parties() {
        let text = "Buyer's agent: Bob Smith 212-555-0199 bob@other.com\n\
                    Listing Agent: Jane Doe\n(518) 555-0101\njane@realty.com\n\
                    Listing Office: Capital Realty Group";
        let agent = agent_from_detail_text(text).unwrap();
        assert_eq!(agent.name.as_deref(), Some("Jane Doe"));
        assert_eq!(agent.phone.as_deref(), Some("518-555-0101"));
        assert_eq!(agent.email.as_deref(), Some("jane@realty.com"));
        assert_eq!(agent.brokerage.as_deref(), Some("Capital Realty Group"));
    }

    #[test]
    fn test_agent_from_detail_text_without_label() {
        assert_eq!(agent_from_detail_text("Call 518-555-0101 today"), None);
    }

    #[test]
    fn test_contact_scan_last_resort() {
        let agent = agent_from_contact_scan("mailto:Info@Realty.com tel:5185550101").unwrap();
        assert_eq!(agent.email.as_deref(), Some("info@realty.com"));
        assert_eq!(agent.phone.as_deref(), Some("518-555-0101"));
        assert!(agent.name.is_none());
    }
}
