pub mod config;
pub mod cookies;
pub mod error;
pub mod sites;
pub mod types;

pub use config::Config;
pub use cookies::{Cookie, CookieJar};
pub use error::{ReprintError, Result};
pub use sites::SiteRule;
pub use types::{Article, ArticleImage, CrawlStatus, SourceType};

/// Count of non-whitespace characters — the word-count metric used for all
/// stored articles (CJK text has no meaningful whitespace-delimited words).
pub fn word_count(text: &str) -> usize {
    text.chars().filter(|c| !c.is_whitespace()).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_count_ignores_whitespace() {
        assert_eq!(word_count("你好 世界\n!"), 5);
        assert_eq!(word_count("   \t\n"), 0);
        assert_eq!(word_count(""), 0);
    }
}
