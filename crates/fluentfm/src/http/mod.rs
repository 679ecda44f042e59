//! HTTP layer for the FileMaker Data API
//!
//! Split by responsibility: `token` keeps the shared session pool alive,
//! `query` accumulates and serializes find clauses, `url` maps operations to
//! endpoint paths, `response` interprets the message envelope, and `client`
//! ties them together behind the fluent `FluentFm` facade.

pub mod client;
pub mod query;
pub mod response;
pub mod token;
pub mod url;


pub use client::FluentFm;
pub use query::{Query, ScriptPhase, Sort, SortOrder};
pub use response::ResponseHandler;
pub use token::{MemoryTokenStore, TokenManager, TokenRetryPolicy, TokenStore};
