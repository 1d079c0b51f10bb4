//! Backlog accounting: how much of the work set is pending, completed, or
//! total, overall and per country. Read-only; used by the `count`
//! subcommand and for progress log lines.

use errors::*;
use time_helpers;

use diesel;
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Text};
use r2d2::Pool;
use r2d2_diesel::ConnectionManager;
use diesel::pg::PgConnection;
use slog::Logger;

pub struct Mediator {
    pub pool:           Pool<ConnectionManager<PgConnection>>,
    pub country_filter: Option<String>,
}

impl Mediator {
    pub fn run(&mut self, log: &Logger) -> Result<RunResult> {
        time_helpers::log_timed(&log.new(o!("step" => file!())), |log| self.run_inner(log))
    }

    fn run_inner(&mut self, log: &Logger) -> Result<RunResult> {
        let conn = self.pool.get()?;

        let total = self.count_total(log, &conn)?;
        let pending = self.count_pending(log, &conn)?;
        let completed = self.count_completed(log, &conn)?;
        let per_country = self.count_pending_per_country(log, &conn)?;

        Ok(RunResult {
            total,
            pending,
            completed,
            per_country,
        })
    }

    //
    // Steps
    //

    fn count_total(&mut self, log: &Logger, conn: &PgConnection) -> Result<i64> {
        time_helpers::log_timed(&log.new(o!("step" => "count_total")), |_log| {
            diesel::sql_query("SELECT COUNT(*) AS count FROM results")
                .get_result::<CountRow>(conn)
                .map(|row| row.count)
                .chain_err(|| "Error counting results")
        })
    }

    fn count_pending(&mut self, log: &Logger, conn: &PgConnection) -> Result<i64> {
        let country = self.country_clause();
        time_helpers::log_timed(&log.new(o!("step" => "count_pending")), |_log| {
            diesel::sql_query(PENDING_COUNT_QUERY)
                .bind::<Text, _>(country)
                .get_result::<CountRow>(conn)
                .map(|row| row.count)
                .chain_err(|| "Error counting pending records")
        })
    }

    fn count_completed(&mut self, log: &Logger, conn: &PgConnection) -> Result<i64> {
        time_helpers::log_timed(&log.new(o!("step" => "count_completed")), |_log| {
            diesel::sql_query(COMPLETED_COUNT_QUERY)
                .get_result::<CountRow>(conn)
                .map(|row| row.count)
                .chain_err(|| "Error counting completed records")
        })
    }

    fn count_pending_per_country(
        &mut self,
        log: &Logger,
        conn: &PgConnection,
    ) -> Result<Vec<(String, i64)>> {
        time_helpers::log_timed(&log.new(o!("step" => "count_pending_per_country")), |_log| {
            diesel::sql_query(COUNTRY_PENDING_QUERY)
                .load::<CountryCountRow>(conn)
                .map(|rows| rows.into_iter().map(|r| (r.country, r.count)).collect())
                .chain_err(|| "Error counting pending records per country")
        })
    }

    fn country_clause(&self) -> String {
        self.country_filter
            .as_ref()
            .map(|c| c.trim().to_uppercase().chars().take(2).collect::<String>())
            .unwrap_or_else(String::new)
    }
}

pub struct RunResult {
    pub total:       i64,
    pub pending:     i64,
    pub completed:   i64,
    pub per_country: Vec<(String, i64)>,
}

//
// Private constants
//

const PENDING_COUNT_QUERY: &str = "
    SELECT COUNT(*) AS count
    FROM results r
    WHERE NOT EXISTS (
        SELECT 1 FROM zen_contacts zc
        WHERE zc.source_link = r.data->>'link'
            AND zc.partition_key = ABS(hashtext(r.data->>'link')) % 32
    )
        AND r.data->>'web_site' IS NOT NULL
        AND r.data->>'web_site' <> ''
        AND ($1 = '' OR UPPER(LEFT(COALESCE(r.data->'complete_address'->>'country', ''), 2)) = $1)";

const COMPLETED_COUNT_QUERY: &str = "
    SELECT COUNT(*) AS count
    FROM results r
    WHERE EXISTS (
        SELECT 1 FROM zen_contacts zc
        WHERE zc.source_link = r.data->>'link'
            AND zc.partition_key = ABS(hashtext(r.data->>'link')) % 32
    )";

const COUNTRY_PENDING_QUERY: &str = "
    SELECT
        UPPER(LEFT(COALESCE(r.data->'complete_address'->>'country', 'XX'), 2)) AS country,
        COUNT(*) AS count
    FROM results r
    WHERE NOT EXISTS (
        SELECT 1 FROM zen_contacts zc
        WHERE zc.source_link = r.data->>'link'
            AND zc.partition_key = ABS(hashtext(r.data->>'link')) % 32
    )
        AND r.data->>'web_site' IS NOT NULL
        AND r.data->>'web_site' <> ''
    GROUP BY 1
    ORDER BY count DESC";

//
// Private types
//

// Exists because `sql_query` doesn't support querying into a tuple, only a
// struct.
#[derive(QueryableByName)]
struct CountRow {
    #[sql_type = "BigInt"]
    count: i64,
}

#[derive(QueryableByName)]
struct CountryCountRow {
    #[sql_type = "Text"]
    country: String,

    #[sql_type = "BigInt"]
    count: i64,
}

//
// Tests
//

#[cfg(test)]
mod tests {
    use mediators::backlog_counter::*;
    use test_helpers;

    #[test]
    #[ignore]
    fn test_counts_are_consistent() {
        let pool = test_helpers::pool();
        let log = test_helpers::log();

        let mut mediator = Mediator {
            pool,
            country_filter: None,
        };
        let res = mediator.run(&log).unwrap();

        assert!(res.total >= 0);
        assert!(res.pending <= res.total);
        let per_country_total: i64 = res.per_country.iter().map(|&(_, n)| n).sum();
        assert_eq!(res.pending, per_country_total);
    }

    #[test]
    #[ignore]
    fn test_country_filter_narrows_pending() {
        let pool = test_helpers::pool();
        let log = test_helpers::log();

        let all = Mediator {
            pool: pool.clone(),
            country_filter: None,
        }.run(&log)
            .unwrap();
        let us_only = Mediator {
            pool,
            country_filter: Some("us".to_owned()),
        }.run(&log)
            .unwrap();

        assert!(us_only.pending <= all.pending);
    }
}
