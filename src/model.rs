//! The application's data layer containing models that will be queried from
//! and inserted into the database.
//!
//! Simple helper functions are allowed, but they should be kept extremely
//! simple, with preference for any and all domain logic to be offloaded to a
//! mediator.

use errors::*;

use chrono::{DateTime, Utc};
use serde_json;

/// A fully materialised contact row as stored in `zen_contacts`. Field order
/// matches the `table!` definition.
#[derive(Clone, Debug, Queryable)]
pub struct Contact {
    pub source_link:   String,
    pub partition_key: i32,

    pub country_code:      String,
    pub country_name:      String,
    pub business_name:     String,
    pub business_category: String,
    pub business_website:  String,

    pub address:     String,
    pub city:        String,
    pub state:       String,
    pub street:      String,
    pub postal_code: String,
    pub latitude:    Option<f64>,
    pub longitude:   Option<f64>,
    pub timezone:    String,

    pub source_id:           Option<i64>,
    pub source_phone:        String,
    pub source_rating:       Option<f64>,
    pub source_review_count: Option<i32>,

    pub emails:         Vec<String>,
    pub emails_count:   i32,
    pub phones:         Vec<String>,
    pub phones_count:   i32,
    pub whatsapp:       Vec<String>,
    pub whatsapp_count: i32,

    pub social_facebook:  Option<String>,
    pub social_instagram: Option<String>,
    pub social_tiktok:    Option<String>,
    pub social_youtube:   Option<String>,

    pub scrape_final_url:      String,
    pub scrape_was_redirected: bool,
    pub scrape_status:         String,
    pub scrape_error:          String,
    pub scrape_time_seconds:   f64,
    pub scrape_pages_count:    i32,
    pub last_scrape_server:    String,
    pub scrape_count:          i32,
    pub last_scrape_at:        DateTime<Utc>,
    pub created_at:            DateTime<Utc>,
    pub updated_at:            DateTime<Utc>,
}

/// A claimed source record, parsed out of the `results` row's JSON blob.
/// `link` is the business's canonical identity; `url` is the website to
/// fetch.
#[derive(Clone, Debug)]
pub struct SourceRecord {
    pub id:   i64,
    pub link: String,
    pub url:  String,

    pub name:     String,
    pub category: String,
    pub country:  String,

    pub address:     String,
    pub city:        String,
    pub state:       String,
    pub street:      String,
    pub postal_code: String,
    pub latitude:    Option<f64>,
    pub longitude:   Option<f64>,
    pub timezone:    String,

    pub phone:         String,
    pub review_rating: Option<f64>,
    pub review_count:  Option<i32>,
}

impl SourceRecord {
    /// Parses a `results.data` blob. Returns `Ok(None)` for records that
    /// fail validation (no `link` or no `web_site`); those stay in the
    /// pending set.
    pub fn from_json(id: i64, raw: &str) -> Result<Option<SourceRecord>> {
        let data: serde_json::Value =
            serde_json::from_str(raw).chain_err(|| format!("Error parsing record {}", id))?;

        let link = json_str(&data, "link");
        let url = json_str(&data, "web_site");
        if link.is_empty() || url.is_empty() {
            return Ok(None);
        }

        let null = serde_json::Value::Null;
        let complete_address = data.get("complete_address").unwrap_or(&null);

        Ok(Some(SourceRecord {
            id,
            link,
            url,
            name: json_str(&data, "title"),
            category: json_str(&data, "category"),
            country: json_str(complete_address, "country"),
            address: json_str(&data, "address"),
            city: json_str(complete_address, "city"),
            state: json_str(complete_address, "state"),
            street: json_str(complete_address, "street"),
            postal_code: json_str(complete_address, "postal_code"),
            latitude: json_f64(&data, "latitude"),
            // The upstream feed spells this one "longtitude"; accept either.
            longitude: json_f64(&data, "longtitude").or_else(|| json_f64(&data, "longitude")),
            timezone: json_str(&data, "timezone"),
            phone: json_str(&data, "phone"),
            review_rating: json_f64(&data, "review_rating"),
            review_count: json_f64(&data, "review_count").map(|v| v as i32),
        }))
    }
}

/// One row bound for the batch upsert: a processed record with its merged
/// contact arrays and scrape metadata.
#[derive(Clone, Debug)]
pub struct PreparedContact {
    pub source_link: String,

    pub country_code:      String,
    pub country_name:      String,
    pub business_name:     String,
    pub business_category: String,
    pub business_website:  String,

    pub address:     String,
    pub city:        String,
    pub state:       String,
    pub street:      String,
    pub postal_code: String,
    pub latitude:    Option<f64>,
    pub longitude:   Option<f64>,
    pub timezone:    String,

    pub source_id:           i64,
    pub source_phone:        String,
    pub source_rating:       Option<f64>,
    pub source_review_count: Option<i32>,

    pub emails:   Vec<String>,
    pub phones:   Vec<String>,
    pub whatsapp: Vec<String>,

    pub facebook:  Option<String>,
    pub instagram: Option<String>,
    pub tiktok:    Option<String>,
    pub youtube:   Option<String>,

    pub final_url:      String,
    pub was_redirected: bool,
    pub status:         String,
    pub error:          String,
    pub time_seconds:   f64,
    pub pages_count:    i32,
}

pub mod insertable {
    use schema::results;

    use serde_json;

    #[derive(Insertable)]
    #[table_name = "results"]
    pub struct SourceRow {
        pub data: serde_json::Value,
    }
}

//
// Private functions
//

fn json_str(value: &serde_json::Value, key: &str) -> String {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .trim()
        .to_owned()
}

// Numeric fields occasionally arrive as strings; accept both.
fn json_f64(value: &serde_json::Value, key: &str) -> Option<f64> {
    value.get(key).and_then(|v| {
        v.as_f64()
            .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
    })
}

//
// Tests
//

#[cfg(test)]
mod tests {
    use model::*;

    #[test]
    fn test_source_record_from_json() {
        let raw = r#"{
            "link": "https://maps.example/biz-1",
            "web_site": "https://biz-1.example",
            "title": "Biz One",
            "category": "Plumber",
            "phone": "+1 555 0100",
            "latitude": 1.5,
            "longtitude": "103.8",
            "review_rating": 4.5,
            "review_count": 12,
            "complete_address": {
                "country": "us",
                "city": "Springfield",
                "state": "IL",
                "postal_code": "62701"
            }
        }"#;

        let record = SourceRecord::from_json(7, raw).unwrap().unwrap();
        assert_eq!(7, record.id);
        assert_eq!("https://maps.example/biz-1", record.link);
        assert_eq!("https://biz-1.example", record.url);
        assert_eq!("Biz One", record.name);
        assert_eq!("us", record.country);
        assert_eq!("Springfield", record.city);
        assert_eq!(Some(1.5), record.latitude);
        assert_eq!(Some(103.8), record.longitude);
        assert_eq!(Some(4.5), record.review_rating);
        assert_eq!(Some(12), record.review_count);
    }

    #[test]
    fn test_source_record_missing_website_is_invalid() {
        let raw = r#"{"link": "https://maps.example/biz-2", "web_site": ""}"#;
        assert!(SourceRecord::from_json(1, raw).unwrap().is_none());

        let raw = r#"{"web_site": "https://biz.example"}"#;
        assert!(SourceRecord::from_json(2, raw).unwrap().is_none());
    }

    #[test]
    fn test_source_record_malformed_json_is_an_error() {
        assert!(SourceRecord::from_json(3, "not json").is_err());
    }
}
