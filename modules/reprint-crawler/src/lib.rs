//! Content acquisition: site detection, the Cloudflare-aware browser
//! fetcher, per-site extraction, and the integrated crawl loop that moves
//! article rows from `pending` to `completed`.

pub mod crawler;
pub mod extractor;
pub mod fetcher;
pub mod sites;
pub mod wechat_extract;

pub use crawler::{BatchSummary, IntegratedCrawler, UrlOutcome};
pub use extractor::{ContentExtractor, ExtractedArticle};
pub use fetcher::BrowserFetcher;
pub use sites::{DetectedSite, SiteRegistry};
