//! Durable versioned dataset storage and the HTTP fetch utilities shared by
//! source adapters.

mod http;
mod store;

pub use http::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, FetchedResponse, HttpClientConfig,
    HttpFetcher, RetryDisposition,
};
pub use store::{diff_summary, StoreError, VersionedStore};

pub const CRATE_NAME: &str = "offerhub-storage";
