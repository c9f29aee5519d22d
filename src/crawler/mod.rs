//! Crawling
//!
//! This module contains the crawl engine:
//! - Targets and the priority frontier they are queued on
//! - Fetchers for direct HTTP and browser-rendered requests
//! - Jobs, which drive one rule's fetch, analyze and requeue loop
//! - The interactive test runner

mod agents;
mod fetcher;
mod job;
mod queue;
mod target;
mod testrun;

pub use agents::UserAgents;
pub use fetcher::{
    build_http_client, BrowserFetcher, FetchContent, FetchError, FetchRequest, FetchResponse,
    Fetcher, Fetchers, HttpFetcher,
};
pub use job::{Job, RunOutcome, FINISHED};
pub use queue::{HigherFn, PriorityQueue};
pub use target::{higher, make_targets, Target};
pub use testrun::{TestRun, TestRunner};
