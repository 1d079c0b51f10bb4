#![recursion_limit = "128"]

#[macro_use]
extern crate chan;
extern crate chrono;
#[macro_use]
extern crate diesel;
#[macro_use]
extern crate error_chain;
extern crate flate2;
extern crate headless_chrome;
#[macro_use]
extern crate lazy_static;
extern crate native_tls;
extern crate r2d2;
extern crate r2d2_diesel;
extern crate rand;
extern crate regex;
extern crate serde;
#[macro_use]
extern crate serde_derive;
#[cfg_attr(test, macro_use)]
extern crate serde_json;
#[macro_use]
extern crate slog;
#[cfg(test)]
extern crate slog_term;
extern crate url;

pub mod browser_pool;
pub mod conn_pool;
pub mod countries;
pub mod error_helpers;
pub mod errors;
pub mod extractor;
pub mod http_requester;
pub mod mediators;
pub mod model;
pub mod optimizer;
pub mod origins;
pub mod scheduler;
pub mod time_helpers;

// Generated file: skip rustfmt
#[cfg_attr(rustfmt, rustfmt_skip)]
pub mod schema;

#[cfg(test)]
mod test_helpers;
