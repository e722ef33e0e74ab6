//! URL -> site rule resolution.

use std::collections::HashMap;

use tracing::{debug, warn};
use url::Url;

use reprint_common::sites::SiteRule;
use reprint_common::{ReprintError, Result, SourceType};

/// A matched site: the config key plus the full rule bundle.
#[derive(Debug, Clone)]
pub struct DetectedSite {
    pub key: String,
    pub rule: SiteRule,
}

impl DetectedSite {
    /// The source_type an article from this site is stored under.
    pub fn source_type(&self) -> SourceType {
        SourceType::parse(&self.key).unwrap_or(SourceType::External)
    }

    pub fn is_wechat(&self) -> bool {
        self.rule.domain == "mp.weixin.qq.com"
    }
}

/// Validated set of site rules, matched against URLs by domain.
pub struct SiteRegistry {
    rules: HashMap<String, SiteRule>,
}

impl SiteRegistry {
    /// Build a registry, rejecting rules that could never work: no
    /// selectors at all, or login required without a full login config.
    pub fn new(rules: HashMap<String, SiteRule>) -> Result<Self> {
        for (key, rule) in &rules {
            validate_rule(key, rule)?;
        }
        Ok(SiteRegistry { rules })
    }

    /// Match a URL against the registered rules: exact domain, `www.`
    /// stripped, or subdomain suffix.
    pub fn detect(&self, url: &str) -> Option<DetectedSite> {
        let parsed = match Url::parse(url) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!(url, error = %e, "Unparseable URL");
                return None;
            }
        };
        let host = parsed.host_str()?.to_lowercase();
        let bare = host.strip_prefix("www.").unwrap_or(&host);

        for (key, rule) in &self.rules {
            let domain = rule.domain.to_lowercase();
            if host == domain
                || bare == domain
                || host.ends_with(&format!(".{domain}"))
                || bare.ends_with(&format!(".{domain}"))
            {
                debug!(url, site = %rule.name, "Detected site");
                return Some(DetectedSite {
                    key: key.clone(),
                    rule: rule.clone(),
                });
            }
        }
        debug!(url, host, "No site rule for host");
        None
    }

    pub fn is_supported(&self, url: &str) -> bool {
        self.detect(url).is_some()
    }

    /// (domain, display name) pairs for diagnostics.
    pub fn supported_sites(&self) -> Vec<(String, String)> {
        let mut sites: Vec<(String, String)> = self
            .rules
            .values()
            .map(|r| (r.domain.clone(), r.name.clone()))
            .collect();
        sites.sort();
        sites
    }

    pub fn rule(&self, key: &str) -> Option<&SiteRule> {
        self.rules.get(key)
    }
}

fn validate_rule(key: &str, rule: &SiteRule) -> Result<()> {
    if rule.domain.is_empty() {
        return Err(ReprintError::Config(format!("site {key}: domain is required")));
    }
    let extraction = &rule.extraction;
    if extraction.title_selectors.is_empty() && extraction.content_selectors.is_empty() {
        return Err(ReprintError::Config(format!(
            "site {key}: needs at least title or content selectors"
        )));
    }
    if rule.requires_login {
        let Some(login) = &rule.login else {
            return Err(ReprintError::Config(format!(
                "site {key}: requires_login without a login config"
            )));
        };
        for (field, value) in [
            ("login_url", &login.login_url),
            ("username_selector", &login.username_selector),
            ("password_selector", &login.password_selector),
            ("submit_selector", &login.submit_selector),
        ] {
            if value.is_empty() {
                return Err(ReprintError::Config(format!(
                    "site {key}: login config missing {field}"
                )));
            }
        }
        if login.username.is_empty() {
            warn!(site = key, "Login required but no username configured");
        }
    }
    Ok(())
}
