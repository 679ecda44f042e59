//! FluentFM - a fluent client for the FileMaker Data API
//!
//! Chains of clause methods build a find request; a terminal (`get`, `exec`,
//! `first`, `last`) or an immediate operation (`create`, `globals`,
//! `find_paginated`) sends it. Session tokens are pooled in a shared store,
//! sampled at random, and repaired transparently when the server rejects one.
//!
//! # Example
//!
//! ```no_run
//! use fluentfm::{Config, FluentFm};
//!
//! # async fn run() -> fluentfm::Result<()> {
//! let mut fm = FluentFm::new(Config::new("fm.example.com", "sales", "user", "pass"))?;
//!
//! let overdue = fm
//!     .find("invoices")
//!     .where_op("total", ">", 100)
//!     .where_empty("paid_at")
//!     .sort_desc("due_date")
//!     .limit(50)
//!     .get()
//!     .await?;
//!
//! for invoice in overdue {
//!     println!("#{}: {:?}", invoice.record_id, invoice.get("total"));
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod http;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use http::client::FluentFm;
pub use http::query::{ScriptPhase, Sort, SortOrder};
pub use http::token::{MemoryTokenStore, TokenManager, TokenRetryPolicy, TokenStore};
pub use types::{Page, Record};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
