use serde_json::Value;

pub const FALLBACK_MIN_AGE: i64 = 0;
pub const FALLBACK_MAX_AGE: i64 = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sex {
    Male,
    Female,
    All,
}

impl Sex {
    pub fn as_str(self) -> &'static str {
        match self {
            Sex::Male => "MALE",
            Sex::Female => "FEMALE",
            Sex::All => "ALL",
        }
    }

    /// Anything outside the two explicit categories maps to ALL, including
    /// a missing field.
    pub fn from_raw(raw: Option<&str>) -> Sex {
        match raw.map(str::trim) {
            Some(s) if s.eq_ignore_ascii_case("MALE") => Sex::Male,
            Some(s) if s.eq_ignore_ascii_case("FEMALE") => Sex::Female,
            _ => Sex::All,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LocationRecord {
    pub facility: String,
    pub city: String,
    pub state: Option<String>,
    pub zip: Option<String>,
    pub country: String,
    pub status: String,
}

#[derive(Debug, Clone)]
pub struct OfficialRecord {
    pub name: String,
    pub affiliation: String,
    pub role: String,
}

#[derive(Debug, Clone)]
pub struct TrialRecord {
    pub sex: Sex,
    pub min_age: i64,
    pub max_age: i64,
    pub start_year: Option<i64>,
    pub locations: Vec<LocationRecord>,
    pub officials: Vec<OfficialRecord>,
}

/// First embedded integer of a free-text age field ("55 Years" -> 55).
pub fn parse_age(raw: Option<&str>) -> Option<i64> {
    let s = raw?;
    let mut digits = String::new();
    for ch in s.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
        } else if !digits.is_empty() {
            break;
        }
    }
    digits.parse().ok()
}

/// Pull one trial out of a ClinicalTrials.gov study object. Returns None when
/// the study has no locations at all; everything else gets fallbacks.
pub fn extract_trial(study: &Value) -> Option<TrialRecord> {
    let protocol = study.get("protocolSection");
    let eligibility = protocol.and_then(|p| p.get("eligibilityModule"));
    let contacts = protocol.and_then(|p| p.get("contactsLocationsModule"));

    let raw_locations = contacts
        .and_then(|c| c.get("locations"))
        .and_then(|l| l.as_array())
        .filter(|l| !l.is_empty())?;

    let sex = Sex::from_raw(eligibility.and_then(|e| e.get("sex")).and_then(|s| s.as_str()));
    let min_age = parse_age(
        eligibility
            .and_then(|e| e.get("minimumAge"))
            .and_then(|a| a.as_str()),
    )
    .unwrap_or(FALLBACK_MIN_AGE);
    let max_age = parse_age(
        eligibility
            .and_then(|e| e.get("maximumAge"))
            .and_then(|a| a.as_str()),
    )
    .unwrap_or(FALLBACK_MAX_AGE);
    // An inverted interval means a malformed source field; fall back wholesale.
    let (min_age, max_age) = if min_age <= max_age {
        (min_age, max_age)
    } else {
        (FALLBACK_MIN_AGE, FALLBACK_MAX_AGE)
    };

    let start_year = protocol
        .and_then(|p| p.get("statusModule"))
        .and_then(|s| s.get("startDateStruct"))
        .and_then(|d| d.get("date"))
        .and_then(|d| d.as_str())
        .and_then(|d| parse_age(Some(d)));

    let locations = raw_locations
        .iter()
        .map(|loc| LocationRecord {
            facility: non_empty(loc, "facility").unwrap_or_else(|| "Unknown Facility".to_string()),
            city: non_empty(loc, "city").unwrap_or_else(|| "Unknown City".to_string()),
            state: non_empty(loc, "state"),
            zip: non_empty(loc, "zip"),
            country: non_empty(loc, "country").unwrap_or_else(|| "Unknown Country".to_string()),
            status: non_empty(loc, "status").unwrap_or_else(|| "Recruiting".to_string()),
        })
        .collect();

    let officials = contacts
        .and_then(|c| c.get("overallOfficials"))
        .and_then(|o| o.as_array())
        .map(|arr| {
            arr.iter()
                .map(|off| OfficialRecord {
                    name: non_empty(off, "name")
                        .unwrap_or_else(|| "Unknown Official".to_string()),
                    affiliation: non_empty(off, "affiliation")
                        .unwrap_or_else(|| "Unknown Affiliation".to_string()),
                    role: non_empty(off, "role").unwrap_or_else(|| "Investigator".to_string()),
                })
                .collect()
        })
        .unwrap_or_default();

    Some(TrialRecord {
        sex,
        min_age,
        max_age,
        start_year,
        locations,
        officials,
    })
}

fn non_empty(v: &Value, key: &str) -> Option<String> {
    v.get(key)
        .and_then(|x| x.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}
