//! Country code normalisation for contact rows.
//!
//! `zen_contacts.country_code` only ever stores a member of the fixed ISO
//! 3166-1 alpha-2 set below; anything unrecognised normalises to `XX`.

use std::collections::HashMap;
use std::collections::HashSet;

/// The sentinel country code stored when a record's country is missing or
/// unrecognised.
pub const UNKNOWN: &str = "XX";

lazy_static! {
    static ref VALID_COUNTRIES: HashSet<&'static str> = {
        let mut s = HashSet::new();
        for code in [
            "AF", "AL", "DZ", "AD", "AO", "AR", "AM", "AU", "AT", "AZ",
            "BH", "BD", "BY", "BE", "BZ", "BJ", "BT", "BO", "BA", "BW",
            "BR", "BN", "BG", "BF", "BI", "KH", "CM", "CA", "CV", "CF",
            "TD", "CL", "CN", "CO", "KM", "CG", "CD", "CR", "CI", "HR",
            "CU", "CY", "CZ", "DK", "DJ", "DM", "DO", "EC", "EG", "SV",
            "GQ", "ER", "EE", "ET", "FJ", "FI", "FR", "GA", "GM", "GE",
            "DE", "GH", "GR", "GT", "GN", "GW", "GY", "HT", "HN", "HK",
            "HU", "IS", "IN", "ID", "IR", "IQ", "IE", "IL", "IT", "JM",
            "JP", "JO", "KZ", "KE", "KW", "KG", "LA", "LV", "LB", "LS",
            "LR", "LY", "LI", "LT", "LU", "MO", "MK", "MG", "MW", "MY",
            "MV", "ML", "MT", "MR", "MU", "MX", "MD", "MC", "MN", "ME",
            "MA", "MZ", "MM", "NA", "NP", "NL", "NZ", "NI", "NE", "NG",
            "NO", "OM", "PK", "PA", "PG", "PY", "PE", "PH", "PL", "PT",
            "QA", "RO", "RU", "RW", "SA", "SN", "RS", "SG", "SK", "SI",
            "SO", "ZA", "KR", "SS", "ES", "LK", "SD", "SR", "SZ", "SE",
            "CH", "SY", "TW", "TJ", "TZ", "TH", "TL", "TG", "TT", "TN",
            "TR", "TM", "UG", "UA", "AE", "GB", "US", "UY", "UZ", "VE",
            "VN", "YE", "ZM", "ZW", "XX",
        ].iter()
        {
            s.insert(*code);
        }
        s
    };

    // Display names for the codes we see most often. Codes without an entry
    // store an empty `country_name`.
    static ref COUNTRY_NAMES: HashMap<&'static str, &'static str> = {
        let mut m = HashMap::new();
        for &(code, name) in [
            ("US", "United States"), ("GB", "United Kingdom"), ("CA", "Canada"),
            ("AU", "Australia"), ("DE", "Germany"), ("FR", "France"), ("IT", "Italy"),
            ("ES", "Spain"), ("JP", "Japan"), ("KR", "South Korea"), ("CN", "China"),
            ("IN", "India"), ("BR", "Brazil"), ("MX", "Mexico"), ("ID", "Indonesia"),
            ("SG", "Singapore"), ("MY", "Malaysia"), ("TH", "Thailand"), ("VN", "Vietnam"),
            ("PH", "Philippines"), ("NL", "Netherlands"), ("BE", "Belgium"), ("CH", "Switzerland"),
            ("AT", "Austria"), ("SE", "Sweden"), ("NO", "Norway"), ("DK", "Denmark"),
            ("FI", "Finland"), ("PL", "Poland"), ("CZ", "Czech Republic"), ("RU", "Russia"),
            ("UA", "Ukraine"), ("TR", "Turkey"), ("SA", "Saudi Arabia"), ("AE", "UAE"),
            ("ZA", "South Africa"), ("EG", "Egypt"), ("NG", "Nigeria"), ("KE", "Kenya"),
            ("NZ", "New Zealand"), ("AR", "Argentina"), ("CL", "Chile"), ("CO", "Colombia"),
            ("PE", "Peru"), ("PT", "Portugal"), ("IE", "Ireland"), ("IL", "Israel"),
        ].iter()
        {
            m.insert(code, name);
        }
        m
    };
}

/// Normalises a raw country value to a member of the valid set: upper-case
/// the first two characters, fall back to `XX` for anything else.
pub fn normalize(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return UNKNOWN.to_owned();
    }

    let code: String = trimmed.chars().take(2).collect::<String>().to_uppercase();
    if trimmed.chars().count() == 2 && VALID_COUNTRIES.contains(code.as_str()) {
        code
    } else {
        UNKNOWN.to_owned()
    }
}

/// Returns a display name for a normalised code, or the empty string for
/// codes we don't carry a name for.
pub fn display_name(code: &str) -> &'static str {
    COUNTRY_NAMES.get(code).cloned().unwrap_or("")
}

pub fn is_valid(code: &str) -> bool {
    VALID_COUNTRIES.contains(code)
}

#[cfg(test)]
mod tests {
    use countries::*;

    #[test]
    fn test_normalize() {
        assert_eq!("US", normalize("us"));
        assert_eq!("US", normalize("US"));
        assert_eq!("XX", normalize("USA"));
        assert_eq!("XX", normalize(""));
        assert_eq!("XX", normalize("  "));
        assert_eq!("XX", normalize("ZZ"));
        assert_eq!("ID", normalize("id"));
    }

    #[test]
    fn test_display_name() {
        assert_eq!("United States", display_name("US"));
        assert_eq!("", display_name("XX"));
        assert_eq!("", display_name("AF"));
    }

    #[test]
    fn test_is_valid() {
        assert!(is_valid("US"));
        assert!(is_valid("XX"));
        assert!(!is_valid("ZZ"));
    }
}
