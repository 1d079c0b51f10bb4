table! {
    results (id) {
        id -> Int8,
        data -> Jsonb,
    }
}

table! {
    zen_contacts (source_link, partition_key) {
        source_link -> Text,
        partition_key -> Int4,
        country_code -> Text,
        country_name -> Text,
        business_name -> Text,
        business_category -> Text,
        business_website -> Text,
        address -> Text,
        city -> Text,
        state -> Text,
        street -> Text,
        postal_code -> Text,
        latitude -> Nullable<Double>,
        longitude -> Nullable<Double>,
        timezone -> Text,
        source_id -> Nullable<Int8>,
        source_phone -> Text,
        source_rating -> Nullable<Double>,
        source_review_count -> Nullable<Int4>,
        emails -> Array<Text>,
        emails_count -> Int4,
        phones -> Array<Text>,
        phones_count -> Int4,
        whatsapp -> Array<Text>,
        whatsapp_count -> Int4,
        social_facebook -> Nullable<Text>,
        social_instagram -> Nullable<Text>,
        social_tiktok -> Nullable<Text>,
        social_youtube -> Nullable<Text>,
        scrape_final_url -> Text,
        scrape_was_redirected -> Bool,
        scrape_status -> Text,
        scrape_error -> Text,
        scrape_time_seconds -> Double,
        scrape_pages_count -> Int4,
        last_scrape_server -> Text,
        scrape_count -> Int4,
        last_scrape_at -> Timestamptz,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}
