//! Contact extraction from fetched HTML.
//!
//! The pipeline only depends on the `Extractor` trait: `(final_url, html)`
//! in, contact arrays and socials out. `RegexExtractor` is the stock
//! implementation; tests use `ExtractorPassThrough` to pin outputs.

use regex::Regex;
use slog::Logger;
use std::collections::HashSet;

#[derive(Clone, Debug, Default)]
pub struct ExtractedContacts {
    pub emails:   Vec<String>,
    pub phones:   Vec<String>,
    pub whatsapp: Vec<String>,

    pub facebook:  Option<String>,
    pub instagram: Option<String>,
    pub tiktok:    Option<String>,
    pub youtube:   Option<String>,
}

impl ExtractedContacts {
    pub fn is_empty(&self) -> bool {
        self.emails.is_empty() && self.phones.is_empty() && self.whatsapp.is_empty()
            && self.facebook.is_none() && self.instagram.is_none() && self.tiktok.is_none()
            && self.youtube.is_none()
    }
}

pub trait Extractor: Send + Sync {
    fn extract(&self, log: &Logger, final_url: &str, html: &str) -> ExtractedContacts;
}

#[derive(Clone, Debug, Default)]
pub struct RegexExtractor;

impl Extractor for RegexExtractor {
    fn extract(&self, log: &Logger, _final_url: &str, html: &str) -> ExtractedContacts {
        let contacts = ExtractedContacts {
            emails:    extract_emails(html),
            phones:    extract_phones(html),
            whatsapp:  extract_whatsapp(html),
            facebook:  first_match(&FACEBOOK, html),
            instagram: first_match(&INSTAGRAM, html),
            tiktok:    first_match(&TIKTOK, html),
            youtube:   first_match(&YOUTUBE, html),
        };

        debug!(log, "Extracted contacts";
            "num_emails" => contacts.emails.len(),
            "num_phones" => contacts.phones.len(),
            "num_whatsapp" => contacts.whatsapp.len());
        contacts
    }
}

/// Returns the same canned contacts for every page.
#[derive(Clone, Debug)]
pub struct ExtractorPassThrough {
    pub contacts: ExtractedContacts,
}

impl Extractor for ExtractorPassThrough {
    fn extract(&self, _log: &Logger, _final_url: &str, _html: &str) -> ExtractedContacts {
        self.contacts.clone()
    }
}

lazy_static! {
    static ref EMAIL: Regex =
        Regex::new(r"(?i)[A-Z0-9._%+-]+@[A-Z0-9.-]+\.[A-Z]{2,}").unwrap();

    // Asset filenames routinely look like emails ("logo@2x.png").
    static ref ASSET_SUFFIX: Regex =
        Regex::new(r"(?i)\.(png|jpe?g|gif|svg|webp|ico|css|js)$").unwrap();

    static ref TEL_HREF: Regex =
        Regex::new(r#"(?i)tel:([+0-9][0-9 ().\-]{5,20}[0-9])"#).unwrap();

    static ref INTL_PHONE: Regex =
        Regex::new(r"\+[0-9][0-9 ().\-]{7,18}[0-9]").unwrap();

    static ref WHATSAPP: Regex =
        Regex::new(r"(?i)(?:wa\.me/|api\.whatsapp\.com/send\?phone=)(\+?[0-9]{6,15})").unwrap();

    static ref FACEBOOK: Regex =
        Regex::new(r"(?i)https?://(?:www\.)?facebook\.com/[A-Za-z0-9_.\-]+").unwrap();
    static ref INSTAGRAM: Regex =
        Regex::new(r"(?i)https?://(?:www\.)?instagram\.com/[A-Za-z0-9_.\-]+").unwrap();
    static ref TIKTOK: Regex =
        Regex::new(r"(?i)https?://(?:www\.)?tiktok\.com/@[A-Za-z0-9_.\-]+").unwrap();
    static ref YOUTUBE: Regex =
        Regex::new(r"(?i)https?://(?:www\.)?youtube\.com/(?:channel/|c/|user/|@)[A-Za-z0-9_\-]+")
            .unwrap();
}

//
// Private functions
//

fn extract_emails(html: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut emails = Vec::new();

    for m in EMAIL.find_iter(html) {
        let email = m.as_str().to_lowercase();
        if ASSET_SUFFIX.is_match(&email) {
            continue;
        }
        if seen.insert(email.clone()) {
            emails.push(email);
        }
    }
    emails
}

fn extract_phones(html: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut phones = Vec::new();

    for caps in TEL_HREF.captures_iter(html) {
        if let Some(normalized) = normalize_phone(&caps[1]) {
            if seen.insert(normalized.clone()) {
                phones.push(normalized);
            }
        }
    }
    for m in INTL_PHONE.find_iter(html) {
        if let Some(normalized) = normalize_phone(m.as_str()) {
            if seen.insert(normalized.clone()) {
                phones.push(normalized);
            }
        }
    }
    phones
}

fn extract_whatsapp(html: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut numbers = Vec::new();

    for caps in WHATSAPP.captures_iter(html) {
        let number = caps[1].trim_left_matches('+').to_owned();
        if seen.insert(number.clone()) {
            numbers.push(number);
        }
    }
    numbers
}

fn first_match(re: &Regex, html: &str) -> Option<String> {
    re.find_iter(html)
        .map(|m| m.as_str().to_owned())
        // Share widgets link to facebook.com/sharer and friends; those
        // aren't the business's own page.
        .find(|url| !url.contains("/sharer") && !url.contains("share.php"))
}

fn normalize_phone(raw: &str) -> Option<String> {
    let normalized: String = raw.chars()
        .filter(|c| c.is_ascii_digit() || *c == '+')
        .collect();
    let digits = normalized.chars().filter(|c| c.is_ascii_digit()).count();
    if digits < 7 || digits > 15 {
        return None;
    }
    Some(normalized)
}

//
// Tests
//

#[cfg(test)]
mod tests {
    use extractor::*;
    use test_helpers;

    #[test]
    fn test_extract_emails_dedupes_and_filters_assets() {
        let html = r#"
            <a href="mailto:Sales@Example.com">sales@example.com</a>
            <img src="logo@2x.png">
            contact: info@example.com
        "#;
        let contacts = extract(html);
        assert_eq!(
            vec!["sales@example.com".to_owned(), "info@example.com".to_owned()],
            contacts.emails
        );
    }

    #[test]
    fn test_extract_phones() {
        let html = r#"
            <a href="tel:+1 (555) 010-0199">Call us</a>
            Or dial +62 812-3456-7890 on mobile.
            <a href="tel:+15550100199">dup</a>
        "#;
        let contacts = extract(html);
        assert_eq!(
            vec!["+15550100199".to_owned(), "+6281234567890".to_owned()],
            contacts.phones
        );
    }

    #[test]
    fn test_extract_whatsapp() {
        let html = r#"<a href="https://wa.me/6281234567890">WhatsApp</a>"#;
        let contacts = extract(html);
        assert_eq!(vec!["6281234567890".to_owned()], contacts.whatsapp);
    }

    #[test]
    fn test_extract_socials_skips_share_widgets() {
        let html = r#"
            <a href="https://www.facebook.com/sharer">share</a>
            <a href="https://www.facebook.com/bizpage">like us</a>
            <a href="https://instagram.com/bizgram">insta</a>
            <a href="https://www.tiktok.com/@biztok">tiktok</a>
            <a href="https://youtube.com/@biztube">videos</a>
        "#;
        let contacts = extract(html);
        assert_eq!(Some("https://www.facebook.com/bizpage".to_owned()), contacts.facebook);
        assert_eq!(Some("https://instagram.com/bizgram".to_owned()), contacts.instagram);
        assert_eq!(Some("https://www.tiktok.com/@biztok".to_owned()), contacts.tiktok);
        assert_eq!(Some("https://youtube.com/@biztube".to_owned()), contacts.youtube);
    }

    #[test]
    fn test_empty_page() {
        let contacts = extract("<html><body>nothing here</body></html>");
        assert!(contacts.is_empty());
    }

    //
    // Private types/functions
    //

    fn extract(html: &str) -> ExtractedContacts {
        RegexExtractor.extract(&test_helpers::log(), "https://example.com/", html)
    }
}
