//! The claim–process–merge pipeline.
//!
//! One run is one batch: claim unprocessed records under transaction-scoped
//! advisory locks, fan the claimed records out across the work-stealing
//! executor (each one fetched through the browser pool or the direct-HTTP
//! path, then extracted), and merge every prepared row into `zen_contacts`
//! with a single array-unioning upsert. The claim transaction stays open
//! across processing; committing it is what releases the locks, and a crash
//! anywhere releases them with the connection.

use browser_pool::{BrowserPool, RenderOpts};
use countries;
use error_helpers;
use errors::*;
use extractor::Extractor;
use http_requester::HttpRequester;
use model::{PreparedContact, SourceRecord};
use optimizer::{AdaptiveOptimizer, Outcome};
use origins::OriginResolver;
use scheduler::{Executor, TaskOutcome, TaskPriority};
use time_helpers;
use time_helpers::duration_secs;

use diesel;
use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::sql_types::{Array, BigInt, Bool, Double, Integer, Nullable, Text};
use r2d2::Pool;
use r2d2_diesel::ConnectionManager;
use slog::Logger;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

pub struct Mediator {
    pub pool: Pool<ConnectionManager<PgConnection>>,

    /// Peer identity, recorded as `last_scrape_server` on every row this
    /// peer merges.
    pub peer_id: String,

    pub batch_size:     i64,
    pub country_filter: Option<String>,
    pub num_workers:    u32,

    /// Allows fetches whose recommendation carries no render flags to skip
    /// the browser and go over the pooled direct-HTTP path.
    pub direct_http: bool,

    pub optimizer:       Arc<AdaptiveOptimizer>,
    pub browser_pool:    Arc<BrowserPool>,
    pub http_requester:  Arc<HttpRequester>,
    pub extractor:       Arc<Extractor>,
    pub origin_resolver: Arc<OriginResolver>,
}

impl Mediator {
    pub fn run(&mut self, log: &Logger) -> Result<RunResult> {
        time_helpers::log_timed(&log.new(o!("step" => file!())), |log| {
            let conn = self.pool.get()?;
            conn.transaction::<_, Error, _>(|| self.run_inner(log, &conn))
        })
    }

    fn run_inner(&mut self, log: &Logger, conn: &PgConnection) -> Result<RunResult> {
        // Batch size zero claims nothing and must issue no SELECT at all.
        if self.batch_size < 1 {
            return Ok(RunResult::default());
        }

        let rows = self.claim_batch(log, conn)?;
        let num_claimed = rows.len() as i64;
        if rows.is_empty() {
            return Ok(RunResult::default());
        }

        let (records, num_invalid) = self.parse_rows(log, rows);
        if records.is_empty() {
            return Ok(RunResult {
                num_claimed,
                num_invalid,
                ..Default::default()
            });
        }

        let prepared = self.process_records(log, records)?;
        let num_failed = prepared
            .iter()
            .filter(|p| p.status != STATUS_SUCCESS)
            .count() as i64;

        let num_upserted = self.upsert_contacts(log, &prepared)? as i64;

        info!(log, "Finished batch";
            "num_claimed" => num_claimed, "num_upserted" => num_upserted,
            "num_failed" => num_failed, "num_invalid" => num_invalid);

        Ok(RunResult {
            num_claimed,
            num_upserted,
            num_failed,
            num_invalid,
        })

        // The surrounding transaction commits after we return, which is the
        // moment the advisory locks release.
    }

    //
    // Steps
    //

    fn claim_batch(&mut self, log: &Logger, conn: &PgConnection) -> Result<Vec<ClaimedRow>> {
        let country = self.country_filter
            .as_ref()
            .map(|c| c.trim().to_uppercase().chars().take(2).collect::<String>())
            .unwrap_or_else(String::new);

        time_helpers::log_timed(
            &log.new(o!("step" => "claim_batch", "batch_size" => self.batch_size)),
            |_log| {
                diesel::sql_query(CLAIM_QUERY)
                    .bind::<Text, _>(country)
                    .bind::<BigInt, _>(self.batch_size)
                    .load::<ClaimedRow>(conn)
                    .chain_err(|| "Error claiming batch")
            },
        )
    }

    fn parse_rows(&mut self, log: &Logger, rows: Vec<ClaimedRow>) -> (Vec<SourceRecord>, i64) {
        let mut records = Vec::with_capacity(rows.len());
        let mut num_invalid = 0i64;

        for row in rows {
            match SourceRecord::from_json(row.id, &row.data) {
                Ok(Some(record)) => records.push(record),
                // Claimed but unusable. The lock still releases on commit
                // and the record stays pending.
                Ok(None) => {
                    warn!(log, "Claimed record failed validation -- skipping"; "id" => row.id);
                    num_invalid += 1;
                }
                Err(e) => {
                    warn!(log, "Claimed record failed to parse -- skipping"; "id" => row.id);
                    error_helpers::print_error(log, &e);
                    num_invalid += 1;
                }
            }
        }

        (records, num_invalid)
    }

    fn process_records(
        &mut self,
        log: &Logger,
        records: Vec<SourceRecord>,
    ) -> Result<Vec<PreparedContact>> {
        time_helpers::log_timed(
            &log.new(o!("step" => "process_records", "num_records" => records.len())),
            |log| {
                let handler = {
                    let optimizer = Arc::clone(&self.optimizer);
                    let browser_pool = Arc::clone(&self.browser_pool);
                    let http_requester = Arc::clone(&self.http_requester);
                    let extractor = Arc::clone(&self.extractor);
                    let origin_resolver = Arc::clone(&self.origin_resolver);
                    let direct_http = self.direct_http;

                    Arc::new(
                        move |log: &Logger, record: SourceRecord| -> Result<PreparedContact> {
                            Ok(process_record(
                                log,
                                &*optimizer,
                                &*browser_pool,
                                &*http_requester,
                                &*extractor,
                                &*origin_resolver,
                                direct_http,
                                record,
                            ))
                        },
                    )
                };

                let executor = Executor::start(log, self.num_workers, handler)?;
                let outcomes =
                    executor.run_batch(records.clone(), TaskPriority::Normal, COLLECT_TIMEOUT);
                executor.stop(log);

                let mut prepared = Vec::new();
                for (outcome, record) in outcomes.into_iter().zip(records) {
                    match outcome {
                        Some(TaskOutcome::Completed(row)) => prepared.push(row),
                        Some(TaskOutcome::Failed(message)) => {
                            error!(log, "Record processing failed";
                                "id" => record.id, "error" => message);
                        }
                        None => {
                            error!(log, "Record processing timed out"; "id" => record.id);
                        }
                    }
                }
                Ok(prepared)
            },
        )
    }

    /// Executes the batch upsert on its own pooled connection so that the
    /// claim transaction is never poisoned by a failed statement. Retries
    /// with exponential backoff; a persistent failure bubbles up and rolls
    /// the whole batch back.
    fn upsert_contacts(&mut self, log: &Logger, rows: &[PreparedContact]) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }

        time_helpers::log_timed(
            &log.new(o!("step" => "upsert_contacts", "num_rows" => rows.len())),
            |log| {
                let conn = self.pool.get()?;

                let mut backoff = UPSERT_RETRY_BASE;
                let mut attempt = 1;
                loop {
                    match self.execute_upsert(&*conn, rows) {
                        Ok(n) => return Ok(n),
                        Err(e) => {
                            if attempt >= UPSERT_RETRIES {
                                return Err(e).chain_err(|| "Batch upsert failed permanently");
                            }
                            warn!(log, "Upsert attempt failed -- backing off";
                                "attempt" => attempt, "backoff" => format!("{:?}", backoff));
                            error_helpers::print_error(log, &e);
                            thread::sleep(backoff);
                            backoff *= 2;
                            attempt += 1;
                        }
                    }
                }
            },
        )
    }

    fn execute_upsert(&self, conn: &PgConnection, rows: &[PreparedContact]) -> Result<usize> {
        let mut source_links = Vec::with_capacity(rows.len());
        let mut country_codes = Vec::with_capacity(rows.len());
        let mut country_names = Vec::with_capacity(rows.len());
        let mut business_names = Vec::with_capacity(rows.len());
        let mut business_categories = Vec::with_capacity(rows.len());
        let mut business_websites = Vec::with_capacity(rows.len());
        let mut addresses = Vec::with_capacity(rows.len());
        let mut cities = Vec::with_capacity(rows.len());
        let mut states = Vec::with_capacity(rows.len());
        let mut streets = Vec::with_capacity(rows.len());
        let mut postal_codes = Vec::with_capacity(rows.len());
        let mut latitudes = Vec::with_capacity(rows.len());
        let mut longitudes = Vec::with_capacity(rows.len());
        let mut timezones = Vec::with_capacity(rows.len());
        let mut source_ids = Vec::with_capacity(rows.len());
        let mut source_phones = Vec::with_capacity(rows.len());
        let mut source_ratings = Vec::with_capacity(rows.len());
        let mut source_review_counts = Vec::with_capacity(rows.len());
        let mut emails_joined = Vec::with_capacity(rows.len());
        let mut phones_joined = Vec::with_capacity(rows.len());
        let mut whatsapp_joined = Vec::with_capacity(rows.len());
        let mut facebooks = Vec::with_capacity(rows.len());
        let mut instagrams = Vec::with_capacity(rows.len());
        let mut tiktoks = Vec::with_capacity(rows.len());
        let mut youtubes = Vec::with_capacity(rows.len());
        let mut final_urls = Vec::with_capacity(rows.len());
        let mut was_redirecteds = Vec::with_capacity(rows.len());
        let mut statuses = Vec::with_capacity(rows.len());
        let mut errors = Vec::with_capacity(rows.len());
        let mut times = Vec::with_capacity(rows.len());
        let mut pages = Vec::with_capacity(rows.len());

        for row in rows {
            source_links.push(row.source_link.clone());
            country_codes.push(row.country_code.clone());
            country_names.push(row.country_name.clone());
            business_names.push(row.business_name.clone());
            business_categories.push(row.business_category.clone());
            business_websites.push(row.business_website.clone());
            addresses.push(row.address.clone());
            cities.push(row.city.clone());
            states.push(row.state.clone());
            streets.push(row.street.clone());
            postal_codes.push(row.postal_code.clone());
            latitudes.push(row.latitude);
            longitudes.push(row.longitude);
            timezones.push(row.timezone.clone());
            source_ids.push(row.source_id);
            source_phones.push(row.source_phone.clone());
            source_ratings.push(row.source_rating);
            source_review_counts.push(row.source_review_count);
            emails_joined.push(sanitize_array(&row.emails).join(";"));
            phones_joined.push(sanitize_array(&row.phones).join(";"));
            whatsapp_joined.push(sanitize_array(&row.whatsapp).join(";"));
            facebooks.push(non_empty(&row.facebook));
            instagrams.push(non_empty(&row.instagram));
            tiktoks.push(non_empty(&row.tiktok));
            youtubes.push(non_empty(&row.youtube));
            final_urls.push(row.final_url.clone());
            was_redirecteds.push(row.was_redirected);
            statuses.push(row.status.clone());
            errors.push(row.error.clone());
            times.push(row.time_seconds);
            pages.push(row.pages_count);
        }

        diesel::sql_query(UPSERT_QUERY)
            .bind::<Array<Text>, _>(source_links)
            .bind::<Array<Text>, _>(country_codes)
            .bind::<Array<Text>, _>(country_names)
            .bind::<Array<Text>, _>(business_names)
            .bind::<Array<Text>, _>(business_categories)
            .bind::<Array<Text>, _>(business_websites)
            .bind::<Array<Text>, _>(addresses)
            .bind::<Array<Text>, _>(cities)
            .bind::<Array<Text>, _>(states)
            .bind::<Array<Text>, _>(streets)
            .bind::<Array<Text>, _>(postal_codes)
            .bind::<Array<Nullable<Double>>, _>(latitudes)
            .bind::<Array<Nullable<Double>>, _>(longitudes)
            .bind::<Array<Text>, _>(timezones)
            .bind::<Array<BigInt>, _>(source_ids)
            .bind::<Array<Text>, _>(source_phones)
            .bind::<Array<Nullable<Double>>, _>(source_ratings)
            .bind::<Array<Nullable<Integer>>, _>(source_review_counts)
            .bind::<Array<Text>, _>(emails_joined)
            .bind::<Array<Text>, _>(phones_joined)
            .bind::<Array<Text>, _>(whatsapp_joined)
            .bind::<Array<Nullable<Text>>, _>(facebooks)
            .bind::<Array<Nullable<Text>>, _>(instagrams)
            .bind::<Array<Nullable<Text>>, _>(tiktoks)
            .bind::<Array<Nullable<Text>>, _>(youtubes)
            .bind::<Array<Text>, _>(final_urls)
            .bind::<Array<Bool>, _>(was_redirecteds)
            .bind::<Array<Text>, _>(statuses)
            .bind::<Array<Text>, _>(errors)
            .bind::<Array<Double>, _>(times)
            .bind::<Array<Integer>, _>(pages)
            .bind::<Text, _>(self.peer_id.clone())
            .execute(conn)
            .chain_err(|| "Error upserting contacts")
    }
}

#[derive(Clone, Debug, Default)]
pub struct RunResult {
    pub num_claimed:  i64,
    pub num_upserted: i64,
    pub num_failed:   i64,
    pub num_invalid:  i64,
}

//
// Public constants
//

pub const STATUS_SUCCESS: &str = "success";
pub const STATUS_FAILED: &str = "failed";
pub const STATUS_TIMEOUT: &str = "timeout";
pub const STATUS_SKIPPED: &str = "skipped";

//
// Private constants
//

// Worst-case wall time for one record: the clamped maximum fetch timeout,
// dispatcher grace, pacing delay, and queueing slack.
const COLLECT_TIMEOUT: Duration = Duration::from_secs(600);

const UPSERT_RETRIES: u32 = 3;
const UPSERT_RETRY_BASE: Duration = Duration::from_secs(1);

// The anti-join, the claim, and the upsert must all derive the partition key
// with the same ABS(hashtext(...)) % 32 expression or rows would be matched
// against the wrong partition.
const CLAIM_QUERY: &str = "
    SELECT r.id, r.data::text AS data
    FROM results r
    WHERE NOT EXISTS (
        SELECT 1 FROM zen_contacts zc
        WHERE zc.source_link = r.data->>'link'
            AND zc.partition_key = ABS(hashtext(r.data->>'link')) % 32
    )
        AND r.data->>'web_site' IS NOT NULL
        AND r.data->>'web_site' <> ''
        AND ($1 = '' OR UPPER(LEFT(COALESCE(r.data->'complete_address'->>'country', ''), 2)) = $1)
        AND pg_try_advisory_xact_lock(r.id)
    ORDER BY r.id
    LIMIT $2";

const UPSERT_QUERY: &str = "
    INSERT INTO zen_contacts (
        source_link, partition_key, country_code, country_name, business_name,
        business_category, business_website, address, city, state, street,
        postal_code, latitude, longitude, timezone, source_id, source_phone,
        source_rating, source_review_count,
        emails, emails_count, phones, phones_count, whatsapp, whatsapp_count,
        social_facebook, social_instagram, social_tiktok, social_youtube,
        scrape_final_url, scrape_was_redirected, scrape_status, scrape_error,
        scrape_time_seconds, scrape_pages_count, last_scrape_server,
        scrape_count, last_scrape_at
    )
    SELECT
        t.source_link,
        ABS(hashtext(t.source_link)) % 32,
        t.country_code, t.country_name, t.business_name, t.business_category,
        t.business_website, t.address, t.city, t.state, t.street,
        t.postal_code, t.latitude, t.longitude, t.timezone, t.source_id,
        t.source_phone, t.source_rating, t.source_review_count,
        ARRAY(
            SELECT DISTINCT e
            FROM unnest(string_to_array(NULLIF(t.emails_joined, ''), ';')) AS e
            WHERE e IS NOT NULL AND e <> ''
        ),
        (
            SELECT COUNT(DISTINCT e)
            FROM unnest(string_to_array(NULLIF(t.emails_joined, ''), ';')) AS e
            WHERE e IS NOT NULL AND e <> ''
        )::int,
        ARRAY(
            SELECT DISTINCT p
            FROM unnest(string_to_array(NULLIF(t.phones_joined, ''), ';')) AS p
            WHERE p IS NOT NULL AND p <> ''
        ),
        (
            SELECT COUNT(DISTINCT p)
            FROM unnest(string_to_array(NULLIF(t.phones_joined, ''), ';')) AS p
            WHERE p IS NOT NULL AND p <> ''
        )::int,
        ARRAY(
            SELECT DISTINCT w
            FROM unnest(string_to_array(NULLIF(t.whatsapp_joined, ''), ';')) AS w
            WHERE w IS NOT NULL AND w <> ''
        ),
        (
            SELECT COUNT(DISTINCT w)
            FROM unnest(string_to_array(NULLIF(t.whatsapp_joined, ''), ';')) AS w
            WHERE w IS NOT NULL AND w <> ''
        )::int,
        t.social_facebook, t.social_instagram, t.social_tiktok,
        t.social_youtube, t.final_url, t.was_redirected, t.status, t.error,
        t.time_seconds, t.pages_count, $32, 1, NOW()
    FROM unnest(
        $1::text[], $2::text[], $3::text[], $4::text[], $5::text[],
        $6::text[], $7::text[], $8::text[], $9::text[], $10::text[],
        $11::text[], $12::float8[], $13::float8[], $14::text[], $15::int8[],
        $16::text[], $17::float8[], $18::int4[], $19::text[], $20::text[],
        $21::text[], $22::text[], $23::text[], $24::text[], $25::text[],
        $26::text[], $27::bool[], $28::text[], $29::text[], $30::float8[],
        $31::int4[]
    ) AS t(
        source_link, country_code, country_name, business_name,
        business_category, business_website, address, city, state, street,
        postal_code, latitude, longitude, timezone, source_id, source_phone,
        source_rating, source_review_count, emails_joined, phones_joined,
        whatsapp_joined, social_facebook, social_instagram, social_tiktok,
        social_youtube, final_url, was_redirected, status, error,
        time_seconds, pages_count
    )
    ON CONFLICT (source_link, partition_key) DO UPDATE SET
        emails = ARRAY(
            SELECT DISTINCT e FROM unnest(
                COALESCE(zen_contacts.emails, '{}') ||
                COALESCE(EXCLUDED.emails, '{}')
            ) AS e WHERE e IS NOT NULL AND e <> ''
        ),
        emails_count = (
            SELECT COUNT(DISTINCT e) FROM unnest(
                COALESCE(zen_contacts.emails, '{}') ||
                COALESCE(EXCLUDED.emails, '{}')
            ) AS e WHERE e IS NOT NULL AND e <> ''
        ),
        phones = ARRAY(
            SELECT DISTINCT p FROM unnest(
                COALESCE(zen_contacts.phones, '{}') ||
                COALESCE(EXCLUDED.phones, '{}')
            ) AS p WHERE p IS NOT NULL AND p <> ''
        ),
        phones_count = (
            SELECT COUNT(DISTINCT p) FROM unnest(
                COALESCE(zen_contacts.phones, '{}') ||
                COALESCE(EXCLUDED.phones, '{}')
            ) AS p WHERE p IS NOT NULL AND p <> ''
        ),
        whatsapp = ARRAY(
            SELECT DISTINCT w FROM unnest(
                COALESCE(zen_contacts.whatsapp, '{}') ||
                COALESCE(EXCLUDED.whatsapp, '{}')
            ) AS w WHERE w IS NOT NULL AND w <> ''
        ),
        whatsapp_count = (
            SELECT COUNT(DISTINCT w) FROM unnest(
                COALESCE(zen_contacts.whatsapp, '{}') ||
                COALESCE(EXCLUDED.whatsapp, '{}')
            ) AS w WHERE w IS NOT NULL AND w <> ''
        ),
        social_facebook = COALESCE(EXCLUDED.social_facebook, zen_contacts.social_facebook),
        social_instagram = COALESCE(EXCLUDED.social_instagram, zen_contacts.social_instagram),
        social_tiktok = COALESCE(EXCLUDED.social_tiktok, zen_contacts.social_tiktok),
        social_youtube = COALESCE(EXCLUDED.social_youtube, zen_contacts.social_youtube),
        scrape_final_url = EXCLUDED.scrape_final_url,
        scrape_was_redirected = EXCLUDED.scrape_was_redirected,
        scrape_status = EXCLUDED.scrape_status,
        scrape_error = EXCLUDED.scrape_error,
        scrape_time_seconds = EXCLUDED.scrape_time_seconds,
        scrape_pages_count = EXCLUDED.scrape_pages_count,
        last_scrape_server = EXCLUDED.last_scrape_server,
        scrape_count = zen_contacts.scrape_count + 1,
        last_scrape_at = NOW(),
        updated_at = NOW()";

//
// Private types
//

// Exists because `sql_query` doesn't support querying into a tuple, only a
// struct.
#[derive(Clone, Debug, QueryableByName)]
struct ClaimedRow {
    #[sql_type = "BigInt"]
    id: i64,

    #[sql_type = "Text"]
    data: String,
}

struct Fetched {
    ok:        bool,
    status:    u16,
    html:      String,
    final_url: String,
    error:     Option<String>,
    elapsed:   Duration,
}

//
// Private functions
//

fn classify_outcome(fetch: &Fetched, timeout: Duration) -> Outcome {
    if fetch.ok {
        return Outcome::Success;
    }
    let timed_out = fetch.error
        .as_ref()
        .map(|e| {
            let lowered = e.to_lowercase();
            lowered.contains("timeout") || lowered.contains("timed out")
        })
        .unwrap_or(false);
    if timed_out || fetch.elapsed >= timeout {
        Outcome::Timeout
    } else {
        Outcome::Failure
    }
}

fn fetch_direct(
    log: &Logger,
    http_requester: &HttpRequester,
    url: &str,
    timeout: Duration,
) -> Fetched {
    let start = Instant::now();
    match http_requester.get(log, url, timeout) {
        Ok(res) => {
            let ok = res.status >= 200 && res.status < 400;
            Fetched {
                ok,
                status: res.status,
                html: String::from_utf8_lossy(&res.body).into_owned(),
                final_url: res.final_url,
                error: if ok {
                    None
                } else {
                    Some(format!("HTTP status {}", res.status))
                },
                elapsed: start.elapsed(),
            }
        }
        Err(e) => Fetched {
            ok:        false,
            status:    0,
            html:      String::new(),
            final_url: url.to_owned(),
            error:     Some(error_strings(&e).join(": ")),
            elapsed:   start.elapsed(),
        },
    }
}

fn fetch_rendered(
    log: &Logger,
    browser_pool: &BrowserPool,
    url: &str,
    timeout: Duration,
    render: RenderOpts,
) -> Fetched {
    let result = browser_pool.fetch(log, url, timeout, render);
    Fetched {
        ok:        result.ok,
        status:    result.status,
        html:      result.html,
        final_url: result.final_url,
        error:     result.error,
        elapsed:   result.elapsed,
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_ref()
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(|v| v.to_owned())
}

// Runs on an executor worker. Never errors: every failure mode is folded
// into the prepared row's status so the record leaves the pending set.
fn process_record(
    log: &Logger,
    optimizer: &AdaptiveOptimizer,
    browser_pool: &BrowserPool,
    http_requester: &HttpRequester,
    extractor: &Extractor,
    origin_resolver: &OriginResolver,
    direct_http: bool,
    record: SourceRecord,
) -> PreparedContact {
    let origin = match origin_resolver.origin(&record.url) {
        Ok(origin) => origin,
        Err(e) => {
            warn!(log, "Record failed pre-fetch validation";
                "id" => record.id, "url" => record.url.clone());
            let fetch = Fetched {
                ok:        false,
                status:    0,
                html:      String::new(),
                final_url: record.url.clone(),
                error:     Some(error_strings(&e).join(": ")),
                elapsed:   Duration::from_secs(0),
            };
            return prepare_contact(record, None, &fetch, STATUS_SKIPPED);
        }
    };

    let recommendation = optimizer.recommend(&origin);
    if recommendation.delay > Duration::from_secs(0) {
        thread::sleep(recommendation.delay);
    }
    optimizer.acquire(&origin, 1.0);

    let direct = direct_http
        && !recommendation.block_resources
        && !recommendation.wait_for_network_idle;
    let fetch = if direct {
        fetch_direct(log, http_requester, &record.url, recommendation.timeout)
    } else {
        let render = RenderOpts {
            block_resources:       recommendation.block_resources,
            wait_for_network_idle: recommendation.wait_for_network_idle,
        };
        fetch_rendered(log, browser_pool, &record.url, recommendation.timeout, render)
    };

    let outcome = classify_outcome(&fetch, recommendation.timeout);
    optimizer.record(log, &origin, outcome, fetch.elapsed);

    let (contacts, status) = match outcome {
        Outcome::Success => (
            Some(extractor.extract(log, &fetch.final_url, &fetch.html)),
            STATUS_SUCCESS,
        ),
        Outcome::Timeout => (None, STATUS_TIMEOUT),
        Outcome::Failure => (None, STATUS_FAILED),
    };

    prepare_contact(record, contacts, &fetch, status)
}

fn prepare_contact(
    record: SourceRecord,
    contacts: Option<::extractor::ExtractedContacts>,
    fetch: &Fetched,
    status: &str,
) -> PreparedContact {
    let contacts = contacts.unwrap_or_default();
    let country_code = countries::normalize(&record.country);
    let was_redirected = !fetch.final_url.is_empty() && fetch.final_url != record.url;

    PreparedContact {
        source_link: record.link,
        country_name: countries::display_name(&country_code).to_owned(),
        country_code,
        business_name: record.name,
        business_category: record.category,
        business_website: record.url,
        address: record.address,
        city: record.city,
        state: record.state,
        street: record.street,
        postal_code: record.postal_code,
        latitude: record.latitude,
        longitude: record.longitude,
        timezone: record.timezone,
        source_id: record.id,
        source_phone: record.phone,
        source_rating: record.review_rating,
        source_review_count: record.review_count,
        emails: sanitize_array(&contacts.emails),
        phones: sanitize_array(&contacts.phones),
        whatsapp: sanitize_array(&contacts.whatsapp),
        facebook: contacts.facebook,
        instagram: contacts.instagram,
        tiktok: contacts.tiktok,
        youtube: contacts.youtube,
        final_url: fetch.final_url.clone(),
        was_redirected,
        status: status.to_owned(),
        error: fetch.error.clone().unwrap_or_default(),
        time_seconds: duration_secs(fetch.elapsed),
        pages_count: if fetch.ok { 1 } else { 0 },
    }
}

// Merged arrays must never carry empties or duplicates; the database merge
// strips them too, but rows should go in clean.
fn sanitize_array(values: &[String]) -> Vec<String> {
    let mut seen = ::std::collections::HashSet::new();
    let mut clean = Vec::with_capacity(values.len());
    for value in values {
        let trimmed = value.trim();
        // A value carrying the join separator wouldn't survive the array
        // encoding used by the upsert.
        if trimmed.is_empty() || trimmed.contains(';') {
            continue;
        }
        if seen.insert(trimmed.to_owned()) {
            clean.push(trimmed.to_owned());
        }
    }
    clean
}

//
// Tests
//

#[cfg(test)]
mod tests {
    use browser_pool::{BrowserFetcherFactoryPassThrough, BrowserPool};
    use extractor::{ExtractedContacts, ExtractorPassThrough};
    use http_requester::HttpRequesterPassThrough;
    use mediators::batch_processor::*;
    use optimizer::OptimizerOptions;
    use origins::UrlOriginResolver;
    use schema;
    use test_helpers;

    use r2d2::{Pool, PooledConnection};

    #[test]
    fn test_classify_outcome() {
        let fetch = |ok: bool, error: Option<&str>, secs: u64| Fetched {
            ok,
            status: if ok { 200 } else { 500 },
            html: String::new(),
            final_url: String::new(),
            error: error.map(|e| e.to_owned()),
            elapsed: Duration::from_secs(secs),
        };
        let timeout = Duration::from_secs(30);

        assert_eq!(Outcome::Success, classify_outcome(&fetch(true, None, 1), timeout));
        assert_eq!(
            Outcome::Failure,
            classify_outcome(&fetch(false, Some("connection refused"), 1), timeout)
        );
        assert_eq!(
            Outcome::Timeout,
            classify_outcome(&fetch(false, Some("Navigation timeout"), 1), timeout)
        );
        assert_eq!(
            Outcome::Timeout,
            classify_outcome(&fetch(false, Some("boom"), 31), timeout)
        );
    }

    #[test]
    fn test_sanitize_array() {
        let values = vec![
            "a@x.com".to_owned(),
            "".to_owned(),
            "  ".to_owned(),
            "a@x.com".to_owned(),
            "b@x.com".to_owned(),
        ];
        assert_eq!(
            vec!["a@x.com".to_owned(), "b@x.com".to_owned()],
            sanitize_array(&values)
        );
    }

    #[test]
    #[ignore]
    fn test_deduplicating_merge() {
        let mut bootstrap = TestBootstrap::new();
        let link = bootstrap.link.clone();

        let (mut mediator, log) = bootstrap.mediator();

        let first = contact_row(&link, &["a@x.com", "b@x.com"], &[], None);
        assert_eq!(1, mediator.upsert_contacts(&log, &[first]).unwrap());

        let second = contact_row(&link, &["b@x.com", "c@x.com"], &["+1"], Some("https://facebook.com/x"));
        assert_eq!(1, mediator.upsert_contacts(&log, &[second]).unwrap());

        let contact = bootstrap.load_contact(&link);
        let mut emails = contact.emails.clone();
        emails.sort();
        assert_eq!(
            vec!["a@x.com".to_owned(), "b@x.com".to_owned(), "c@x.com".to_owned()],
            emails
        );
        assert_eq!(3, contact.emails_count);
        assert_eq!(vec!["+1".to_owned()], contact.phones);
        assert_eq!(1, contact.phones_count);
        assert_eq!(2, contact.scrape_count);
        // A later null social never clobbers an earlier value.
        assert_eq!(Some("https://facebook.com/x".to_owned()), contact.social_facebook);
    }

    #[test]
    #[ignore]
    fn test_partition_key_matches_server_hash() {
        let mut bootstrap = TestBootstrap::new();
        let link = bootstrap.link.clone();

        let (mut mediator, log) = bootstrap.mediator();
        let row = contact_row(&link, &["a@x.com"], &[], None);
        mediator.upsert_contacts(&log, &[row]).unwrap();

        let contact = bootstrap.load_contact(&link);
        let expected = bootstrap.server_partition_key(&link);
        assert_eq!(expected, contact.partition_key);
    }

    #[test]
    #[ignore]
    fn test_full_run_enriches_pending_record() {
        let mut bootstrap = TestBootstrap::new();
        let link = bootstrap.link.clone();
        bootstrap.insert_source_record(&link);

        let (mut mediator, log) = bootstrap.mediator();
        let res = mediator.run(&log).unwrap();
        assert_eq!(1, res.num_claimed);
        assert_eq!(1, res.num_upserted);
        assert_eq!(0, res.num_failed);

        let contact = bootstrap.load_contact(&link);
        assert_eq!(STATUS_SUCCESS, contact.scrape_status);
        assert_eq!(vec!["sales@example.com".to_owned()], contact.emails);
        assert_eq!("US", contact.country_code);
        assert_eq!(bootstrap.peer_id.clone(), contact.last_scrape_server);

        // The record is no longer pending, so a second run claims nothing.
        let res = mediator.run(&log).unwrap();
        assert_eq!(0, res.num_claimed);
    }

    #[test]
    #[ignore]
    fn test_batch_size_zero_is_a_no_op() {
        let mut bootstrap = TestBootstrap::new();
        let (mut mediator, log) = bootstrap.mediator();
        mediator.batch_size = 0;

        let res = mediator.run(&log).unwrap();
        assert_eq!(0, res.num_claimed);
        assert_eq!(0, res.num_upserted);
    }

    #[test]
    #[ignore]
    fn test_claim_with_unmatched_country_filter() {
        let conn = test_helpers::connection();
        let mut bootstrap = TestBootstrap::new();

        let (mut mediator, log) = bootstrap.mediator();
        // No record carries this country, so the claim comes back empty.
        mediator.country_filter = Some("ZW".to_owned());

        let rows = mediator.claim_batch(&log, &conn).unwrap();
        assert!(rows.is_empty());
    }

    // Two peers, one pending record: exactly one of them claims and merges
    // it. The other either loses the advisory lock race or sees the record
    // already completed.
    #[test]
    #[ignore]
    fn test_concurrent_claim_is_exclusive() {
        use std::thread;

        let mut bootstrap = TestBootstrap::new();
        let link = bootstrap.link.clone();
        bootstrap.insert_source_record(&link);

        let mut handles = vec![];
        for i in 0..2 {
            let link_clone = link.clone();
            let peer_id = format!("test_peer_{}", i);
            handles.push(thread::spawn(move || {
                let mut peer = TestBootstrap::for_peer(&link_clone, &peer_id);
                let (mut mediator, log) = peer.mediator();
                let res = mediator.run(&log).unwrap();
                peer.skip_cleanup();
                res.num_claimed
            }));
        }

        let total_claimed: i64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(1, total_claimed);

        let count = bootstrap.count_contacts(&link);
        assert_eq!(1, count);
    }

    //
    // Private types/functions
    //

    struct TestBootstrap {
        conn:         PooledConnection<::r2d2_diesel::ConnectionManager<PgConnection>>,
        link:         String,
        log:          Logger,
        peer_id:      String,
        pool:         Pool<::r2d2_diesel::ConnectionManager<PgConnection>>,
        skip_cleanup: bool,
    }

    impl TestBootstrap {
        fn new() -> TestBootstrap {
            let link = format!("https://maps.example/test-{}", ::rand::random::<u64>());
            TestBootstrap::for_peer(&link, "test_peer")
        }

        fn for_peer(link: &str, peer_id: &str) -> TestBootstrap {
            let pool = test_helpers::pool();
            let conn = pool.get().map_err(Error::from).unwrap();
            TestBootstrap {
                conn,
                link: link.to_owned(),
                log: test_helpers::log(),
                peer_id: peer_id.to_owned(),
                pool,
                skip_cleanup: false,
            }
        }

        fn mediator(&mut self) -> (Mediator, Logger) {
            let optimizer = Arc::new(AdaptiveOptimizer::new(&self.log, seeded_options()));
            let browser_pool = Arc::new(
                BrowserPool::start(
                    &self.log,
                    Box::new(BrowserFetcherFactoryPassThrough {
                        data: Arc::new(test_helpers::CONTACT_PAGE.to_owned()),
                    }),
                    2,
                ).unwrap(),
            );

            (
                Mediator {
                    pool:           self.pool.clone(),
                    peer_id:        self.peer_id.clone(),
                    batch_size:     10,
                    country_filter: None,
                    num_workers:    2,
                    direct_http:    false,
                    optimizer,
                    browser_pool,
                    http_requester: Arc::new(HttpRequesterPassThrough {
                        data: Arc::new(test_helpers::CONTACT_PAGE.as_bytes().to_vec()),
                    }),
                    extractor: Arc::new(ExtractorPassThrough {
                        contacts: ExtractedContacts {
                            emails: vec!["sales@example.com".to_owned()],
                            ..Default::default()
                        },
                    }),
                    origin_resolver: Arc::new(UrlOriginResolver),
                },
                self.log.clone(),
            )
        }

        fn insert_source_record(&mut self, link: &str) {
            let data = json!({
                "link": link,
                "web_site": "https://biz.example/",
                "title": "Test Biz",
                "category": "Testing",
                "complete_address": {"country": "US"}
            });
            ::diesel::insert_into(schema::results::table)
                .values(&::model::insertable::SourceRow { data })
                .execute(&*self.conn)
                .unwrap();
        }

        fn load_contact(&mut self, link: &str) -> ::model::Contact {
            schema::zen_contacts::table
                .filter(schema::zen_contacts::source_link.eq(link))
                .first(&*self.conn)
                .unwrap()
        }

        fn count_contacts(&mut self, link: &str) -> i64 {
            schema::zen_contacts::table
                .filter(schema::zen_contacts::source_link.eq(link))
                .count()
                .first(&*self.conn)
                .unwrap()
        }

        fn server_partition_key(&mut self, link: &str) -> i32 {
            #[derive(QueryableByName)]
            struct HashRow {
                #[sql_type = "Integer"]
                key: i32,
            }
            let row: HashRow = ::diesel::sql_query("SELECT ABS(hashtext($1)) % 32 AS key")
                .bind::<Text, _>(link)
                .get_result(&*self.conn)
                .unwrap();
            row.key
        }

        fn skip_cleanup(&mut self) {
            self.skip_cleanup = true;
        }
    }

    impl Drop for TestBootstrap {
        fn drop(&mut self) {
            if self.skip_cleanup {
                return;
            }
            let _ = ::diesel::delete(
                schema::zen_contacts::table
                    .filter(schema::zen_contacts::source_link.eq(self.link.as_str())),
            ).execute(&*self.conn);
            let _ = ::diesel::sql_query("DELETE FROM results WHERE data->>'link' = $1")
                .bind::<Text, _>(self.link.clone())
                .execute(&*self.conn);
        }
    }

    fn contact_row(
        link: &str,
        emails: &[&str],
        phones: &[&str],
        facebook: Option<&str>,
    ) -> PreparedContact {
        PreparedContact {
            source_link:         link.to_owned(),
            country_code:        "US".to_owned(),
            country_name:        "United States".to_owned(),
            business_name:       "Test Biz".to_owned(),
            business_category:   "Testing".to_owned(),
            business_website:    "https://biz.example/".to_owned(),
            address:             String::new(),
            city:                String::new(),
            state:               String::new(),
            street:              String::new(),
            postal_code:         String::new(),
            latitude:            None,
            longitude:           None,
            timezone:            String::new(),
            source_id:           1,
            source_phone:        String::new(),
            source_rating:       None,
            source_review_count: None,
            emails:              emails.iter().map(|e| e.to_string()).collect(),
            phones:              phones.iter().map(|p| p.to_string()).collect(),
            whatsapp:            vec![],
            facebook:            facebook.map(|f| f.to_owned()),
            instagram:           None,
            tiktok:              None,
            youtube:             None,
            final_url:           "https://biz.example/".to_owned(),
            was_redirected:      false,
            status:              STATUS_SUCCESS.to_owned(),
            error:               String::new(),
            time_seconds:        0.5,
            pages_count:         1,
        }
    }

    fn seeded_options() -> OptimizerOptions {
        let mut options = OptimizerOptions::default();
        options.seed = Some(42);
        options
    }
}
