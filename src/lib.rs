//! Weekly box office sync
//!
//! Fetches the weekly box office chart, matches it against a Radarr library,
//! optionally adds missing titles, and keeps one snapshot per week.

pub mod config;
pub mod error;
pub mod jobs;
pub mod services;
pub mod types;
