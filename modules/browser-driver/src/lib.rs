//! Capability seam over a headless browser.
//!
//! The pipeline needs exactly this from a browser: navigate and read the
//! final DOM, move cookies in and out, and drive login forms. Everything
//! else (Chrome lifecycle, CDP plumbing) stays behind `BrowserDriver` so the
//! fetcher can be tested against a scripted fake.

pub mod error;

pub use error::{BrowserError, Result};

use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfigBuilder};
use chromiumoxide::cdp::browser_protocol::network::CookieParam;
use chromiumoxide::page::Page;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use reprint_common::cookies::Cookie;

/// How often `wait_for_selector` polls the page.
const SELECTOR_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn start(&mut self) -> Result<()>;
    async fn stop(&mut self) -> Result<()>;
    /// Navigate and wait for the load to settle.
    async fn goto(&self, url: &str) -> Result<()>;
    /// Final DOM of the current page.
    async fn html(&self) -> Result<String>;
    async fn current_url(&self) -> Result<String>;
    async fn set_cookie(&self, cookie: &Cookie) -> Result<()>;
    /// All cookies visible to the current browsing context, normalized.
    async fn cookies(&self) -> Result<Vec<Cookie>>;
    /// Poll for a selector; Ok(true) once present, Ok(false) on timeout.
    async fn wait_for_selector(&self, selector: &str, timeout: Duration) -> Result<bool>;
    async fn click(&self, selector: &str) -> Result<()>;
    async fn type_text(&self, selector: &str, text: &str) -> Result<()>;
}

/// Launch options for the chromiumoxide-backed driver.
#[derive(Debug, Clone)]
pub struct DriverOptions {
    pub headless: bool,
    pub user_agent: String,
    pub window_size: (u32, u32),
    pub request_timeout: Duration,
}

impl Default for DriverOptions {
    fn default() -> Self {
        DriverOptions {
            headless: true,
            user_agent: String::new(),
            window_size: (1920, 1080),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Headless Chromium over the DevTools protocol. One instance per workflow
/// execution; the handler task is aborted on stop.
pub struct ChromiumDriver {
    options: DriverOptions,
    browser: Option<Browser>,
    handler: Option<JoinHandle<()>>,
    page: Option<Page>,
}

impl ChromiumDriver {
    pub fn new(options: DriverOptions) -> Self {
        ChromiumDriver {
            options,
            browser: None,
            handler: None,
            page: None,
        }
    }

    fn page(&self) -> Result<&Page> {
        self.page.as_ref().ok_or(BrowserError::NotStarted)
    }
}

#[async_trait]
impl BrowserDriver for ChromiumDriver {
    async fn start(&mut self) -> Result<()> {
        if self.browser.is_some() {
            return Ok(());
        }

        let mut builder = BrowserConfigBuilder::default()
            .request_timeout(self.options.request_timeout)
            .window_size(self.options.window_size.0, self.options.window_size.1)
            .arg("--no-sandbox")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--disable-extensions");
        if !self.options.user_agent.is_empty() {
            builder = builder.arg(format!("--user-agent={}", self.options.user_agent));
        }
        if !self.options.headless {
            builder = builder.with_head();
        }
        let config = builder.build().map_err(BrowserError::Launch)?;

        info!(headless = self.options.headless, "Launching Chromium");
        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| BrowserError::Launch(e.to_string()))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!(error = ?e, "Browser handler event error");
                }
            }
        });

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| BrowserError::Launch(e.to_string()))?;

        self.browser = Some(browser);
        self.handler = Some(handler_task);
        self.page = Some(page);
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.page = None;
        if let Some(mut browser) = self.browser.take() {
            if let Err(e) = browser.close().await {
                warn!(error = %e, "Browser close failed");
            }
            let _ = browser.wait().await;
        }
        if let Some(handler) = self.handler.take() {
            handler.abort();
        }
        info!("Chromium stopped");
        Ok(())
    }

    async fn goto(&self, url: &str) -> Result<()> {
        let page = self.page()?;
        page.goto(url)
            .await
            .map_err(|e| BrowserError::Navigation(format!("{url}: {e}")))?;
        // Navigation resolves when the main frame commits; wait for load.
        if let Err(e) = page.wait_for_navigation().await {
            debug!(url, error = %e, "wait_for_navigation raced the load event");
        }
        Ok(())
    }

    async fn html(&self) -> Result<String> {
        Ok(self.page()?.content().await?)
    }

    async fn current_url(&self) -> Result<String> {
        let url = self.page()?.url().await?;
        Ok(url.unwrap_or_default())
    }

    async fn set_cookie(&self, cookie: &Cookie) -> Result<()> {
        let param = CookieParam::builder()
            .name(&cookie.name)
            .value(&cookie.value)
            .domain(&cookie.domain)
            .path(&cookie.path)
            .secure(cookie.secure)
            .http_only(cookie.http_only)
            .build()
            .map_err(BrowserError::Protocol)?;
        self.page()?.set_cookies(vec![param]).await?;
        Ok(())
    }

    async fn cookies(&self) -> Result<Vec<Cookie>> {
        let raw = self.page()?.get_cookies().await?;
        // Normalize the protocol shape at the boundary; sanitization happens
        // at the jar.
        Ok(raw
            .into_iter()
            .map(|c| Cookie {
                name: c.name,
                value: c.value,
                domain: c.domain.trim_start_matches('.').to_string(),
                path: c.path,
                secure: c.secure,
                http_only: c.http_only,
            })
            .collect())
    }

    async fn wait_for_selector(&self, selector: &str, timeout: Duration) -> Result<bool> {
        let page = self.page()?;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if page.find_element(selector).await.is_ok() {
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(SELECTOR_POLL_INTERVAL).await;
        }
    }

    async fn click(&self, selector: &str) -> Result<()> {
        let element = self
            .page()?
            .find_element(selector)
            .await
            .map_err(|_| BrowserError::ElementNotFound(selector.to_string()))?;
        element.click().await?;
        Ok(())
    }

    async fn type_text(&self, selector: &str, text: &str) -> Result<()> {
        let element = self
            .page()?
            .find_element(selector)
            .await
            .map_err(|_| BrowserError::ElementNotFound(selector.to_string()))?;
        element.click().await?;
        element.type_str(text).await?;
        Ok(())
    }
}
