pub mod autoreply;
pub mod broadcast;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod eventbus;
pub mod ratelimit;
pub mod repositories;
pub mod scraper;
pub mod sessions;
pub mod transport;
pub mod util;

#[cfg(test)]
pub mod test_utils;

pub use db::Database;
pub use wagate_common::Error;
