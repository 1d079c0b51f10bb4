use diesel::pg::PgConnection;
use diesel::prelude::*;
use r2d2::Pool;
use r2d2_diesel::ConnectionManager;
use slog;
use slog::{Drain, Logger};
use slog_term;
use std;
use std::env;
use std::time::Duration;

// Maximum size of the test connection pool. Tests that exercise concurrent
// claims hold one connection per simulated peer.
pub const NUM_CONNECTIONS: u32 = 10;

/// A single connection wrapped in a test transaction that rolls back when
/// dropped. Good for tests that never need a second connection to observe
/// their writes.
pub fn connection() -> PgConnection {
    let conn = PgConnection::establish(&database_url()).unwrap();
    conn.begin_test_transaction().unwrap();
    conn
}

/// A pool of real committing connections for tests that exercise
/// cross-connection behaviour (advisory locks, upserts). These tests must
/// clean up after themselves.
pub fn pool() -> Pool<ConnectionManager<PgConnection>> {
    let manager = ConnectionManager::<PgConnection>::new(database_url());
    Pool::builder()
        .connection_timeout(Duration::from_secs(10))
        .max_size(NUM_CONNECTIONS)
        .build(manager)
        .unwrap()
}

pub fn log() -> Logger {
    let decorator = slog_term::PlainSyncDecorator::new(std::io::stdout());
    let drain = slog_term::CompactFormat::new(decorator).build().fuse();
    slog::Logger::root(drain, o!("env" => "test"))
}

/// A page carrying one of everything the extractor looks for.
pub const CONTACT_PAGE: &str = r#"<html><body>
    <a href="mailto:sales@example.com">Email us</a>
    <a href="tel:+15550100100">Call</a>
    <a href="https://wa.me/15550100100">WhatsApp</a>
    <a href="https://facebook.com/example">Facebook</a>
</body></html>"#;

//
// Private functions
//

fn database_url() -> String {
    env::var("TEST_DATABASE_URL").expect("TEST_DATABASE_URL must be set in order to run tests")
}
