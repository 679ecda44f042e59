//! Connection configuration for the FluentFM client

/// Configuration for a FileMaker Data API connection
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host name, e.g. `fm.example.com`. A scheme may be included
    /// (`http://localhost:8080`); without one, `https` is assumed.
    pub host: String,
    /// Database (file) name
    pub file: String,
    /// Account name for Basic-auth session creation
    pub user: String,
    /// Account password
    pub pass: String,
    /// Upper bound on the shared token pool
    pub token_limit: usize,
    /// Generate a UUID v4 `id` field on create() when the caller omits one
    pub auto_id: bool,
    /// Verify TLS certificates. Off by default: FileMaker deployments
    /// commonly run with self-signed certificates.
    pub validate_tls: bool,
    /// Connect timeout in seconds
    pub connect_timeout_secs: u64,
    /// Overall request timeout in seconds
    pub timeout_secs: u64,
}

impl Config {
    pub fn new(
        host: impl Into<String>,
        file: impl Into<String>,
        user: impl Into<String>,
        pass: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            file: file.into(),
            user: user.into(),
            pass: pass.into(),
            token_limit: 10,
            auto_id: false,
            validate_tls: false,
            connect_timeout_secs: 10,
            timeout_secs: 60,
        }
    }

    /// Set the token pool capacity
    pub fn with_token_limit(mut self, limit: usize) -> Self {
        self.token_limit = limit;
        self
    }

    /// Enable or disable generated record ids on create()
    pub fn with_auto_id(mut self, auto_id: bool) -> Self {
        self.auto_id = auto_id;
        self
    }

    /// Enable or disable TLS certificate verification
    pub fn with_validate_tls(mut self, validate: bool) -> Self {
        self.validate_tls = validate;
        self
    }

    /// Base URL for all Data API paths, with a trailing slash so relative
    /// endpoint paths join cleanly.
    pub fn base_url(&self) -> String {
        if self.host.contains("://") {
            format!("{}/fmi/data/v1/databases/{}/", self.host, self.file)
        } else {
            format!("https://{}/fmi/data/v1/databases/{}/", self.host, self.file)
        }
    }
}
