use thiserror::Error;

use crate::types::CrawlStatus;

#[derive(Error, Debug)]
pub enum ReprintError {
    /// WeChat session token/cookie rejected by the backend. Never retried
    /// automatically; the operator must re-login.
    #[error("Credentials expired: {0}")]
    CredentialsExpired(String),

    /// The backend refused the request due to request frequency.
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Final response was a Cloudflare denial after the interstitial wait.
    #[error("Blocked by Cloudflare: {0}")]
    CloudflareBlocked(String),

    /// Site login flow failed (form not found, no success indicator).
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// HTML parsed but no usable title or content.
    #[error("Extraction failed: {0}")]
    Extraction(String),

    /// The forum republish transaction failed and was rolled back.
    #[error("Forum publish failed: {0}")]
    Publish(String),

    /// Step wall-clock budget exceeded.
    #[error("TIMEOUT: step exceeded {0}s")]
    Timeout(u64),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Illegal crawl-status transition: {from} -> {to}")]
    IllegalTransition { from: CrawlStatus, to: CrawlStatus },

    #[error("Browser error: {0}")]
    Browser(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl ReprintError {
    /// Process exit code for CLI triggers: 2 for expired credentials,
    /// 3 for rate limiting, 1 for everything else.
    pub fn exit_code(&self) -> i32 {
        match self {
            ReprintError::CredentialsExpired(_) => 2,
            ReprintError::RateLimited(_) => 3,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, ReprintError>;
