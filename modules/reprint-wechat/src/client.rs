use std::fs;
use std::path::Path;
use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime};
use serde::Deserialize;
use tracing::{info, warn};

use reprint_common::{ReprintError, Result};

const MP_BASE_URL: &str = "https://mp.weixin.qq.com";
/// The list endpoint returns at most this many articles per request.
const LIST_PAGE_SIZE: u32 = 5;

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                          (KHTML, like Gecko) Chrome/107.0.0.0 Safari/537.36";

const EXPIRED_MESSAGES: [&str; 4] = [
    "invalid session",
    "invalid csrf token",
    "missing session",
    "missing csrf token",
];

/// Session credentials produced by the external OAuth login flow.
#[derive(Debug, Clone, Deserialize)]
pub struct WechatAuth {
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub cookie: String,
}

impl WechatAuth {
    pub fn load(path: &Path) -> Result<WechatAuth> {
        let raw = fs::read_to_string(path).map_err(|e| {
            ReprintError::Config(format!("cannot read wechat auth {}: {e}", path.display()))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            ReprintError::Config(format!("cannot parse wechat auth {}: {e}", path.display()))
        })
    }

    pub fn is_complete(&self) -> bool {
        !self.token.is_empty() && !self.cookie.is_empty()
    }
}

/// A discovered article link, pre-normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredArticle {
    pub title: String,
    pub link: String,
    pub publish_time: NaiveDateTime,
}

#[derive(Debug, Deserialize, Default)]
struct BaseResp {
    #[serde(default)]
    ret: i64,
    #[serde(default)]
    err_msg: String,
}

#[derive(Debug, Deserialize)]
struct SearchBizResponse {
    #[serde(default)]
    base_resp: Option<BaseResp>,
    #[serde(default)]
    list: Vec<BizEntry>,
}

#[derive(Debug, Deserialize)]
struct BizEntry {
    #[serde(default)]
    nickname: String,
    #[serde(default)]
    fakeid: String,
}

#[derive(Debug, Deserialize)]
struct AppMsgPublishResponse {
    #[serde(default)]
    base_resp: Option<BaseResp>,
    /// Nested JSON document, serialized as a string by the backend.
    #[serde(default)]
    publish_page: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PublishPage {
    #[serde(default)]
    publish_list: Vec<PublishItem>,
}

#[derive(Debug, Deserialize)]
struct PublishItem {
    /// Another stringified JSON document.
    #[serde(default)]
    publish_info: String,
}

#[derive(Debug, Deserialize)]
struct PublishInfo {
    #[serde(default)]
    appmsgex: Vec<AppMsg>,
}

#[derive(Debug, Deserialize)]
struct AppMsg {
    #[serde(default)]
    title: String,
    #[serde(default)]
    link: String,
    #[serde(default)]
    create_time: i64,
}

/// HTTP client for the Official Accounts backend.
pub struct WechatClient {
    http: reqwest::Client,
    base_url: String,
    auth: WechatAuth,
}

impl WechatClient {
    pub fn new(auth: WechatAuth) -> Self {
        WechatClient::with_base_url(auth, MP_BASE_URL)
    }

    pub fn with_base_url(auth: WechatAuth, base_url: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to build WeChat HTTP client");
        WechatClient {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.auth.is_complete()
    }

    /// Resolve an account's fakeid by display name. Ok(None) when the
    /// account is simply not found.
    pub async fn search_biz(&self, account_name: &str) -> Result<Option<String>> {
        let url = format!("{}/cgi-bin/searchbiz", self.base_url);
        let resp = self
            .http
            .get(&url)
            .query(&[
                ("action", "search_biz"),
                ("begin", "0"),
                ("count", "5"),
                ("query", account_name),
                ("token", self.auth.token.as_str()),
                ("lang", "zh_CN"),
                ("f", "json"),
                ("ajax", "1"),
            ])
            .header("Cookie", &self.auth.cookie)
            .header("User-Agent", USER_AGENT)
            .header("Referer", MP_BASE_URL)
            .send()
            .await;
        // Network trouble is not an account-level failure: log and move on.
        let resp = match resp {
            Ok(resp) => resp,
            Err(e) => {
                warn!(account = account_name, error = %e, "search_biz request failed");
                return Ok(None);
            }
        };
        let body: SearchBizResponse = match resp.json().await {
            Ok(body) => body,
            Err(e) => {
                warn!(account = account_name, error = %e, "search_biz response unparseable");
                return Ok(None);
            }
        };
        check_base_resp(body.base_resp.as_ref(), "search_biz")?;

        let fakeid = body
            .list
            .into_iter()
            .find(|e| e.nickname == account_name && !e.fakeid.is_empty())
            .map(|e| e.fakeid);
        if fakeid.is_none() {
            info!(account = account_name, "Account not found via search_biz");
        }
        Ok(fakeid)
    }

    /// Enumerate recent published articles for a fakeid, newest first.
    pub async fn list_published(
        &self,
        account_name: &str,
        fakeid: &str,
        limit: u32,
    ) -> Result<Vec<DiscoveredArticle>> {
        let url = format!("{}/cgi-bin/appmsgpublish", self.base_url);
        let count = limit.min(LIST_PAGE_SIZE).to_string();
        let resp = self
            .http
            .get(&url)
            .query(&[
                ("sub", "list"),
                ("begin", "0"),
                ("count", count.as_str()),
                ("fakeid", fakeid),
                ("type", "101_1"),
                ("sub_action", "list_ex"),
                ("token", self.auth.token.as_str()),
                ("lang", "zh_CN"),
                ("f", "json"),
                ("ajax", "1"),
            ])
            .header("Cookie", &self.auth.cookie)
            .header("User-Agent", USER_AGENT)
            .header("Referer", MP_BASE_URL)
            .send()
            .await;
        let resp = match resp {
            Ok(resp) => resp,
            Err(e) => {
                warn!(account = account_name, error = %e, "appmsgpublish request failed");
                return Ok(Vec::new());
            }
        };
        let body: AppMsgPublishResponse = match resp.json().await {
            Ok(body) => body,
            Err(e) => {
                warn!(account = account_name, error = %e, "appmsgpublish response unparseable");
                return Ok(Vec::new());
            }
        };
        check_base_resp(body.base_resp.as_ref(), "appmsgpublish")?;

        let page_raw = match body.publish_page {
            Some(raw) if !raw.is_empty() => raw,
            _ => {
                warn!(account = account_name, "appmsgpublish response has no publish_page");
                return Ok(Vec::new());
            }
        };
        let page: PublishPage = match serde_json::from_str(&page_raw) {
            Ok(page) => page,
            Err(e) => {
                warn!(account = account_name, error = %e, "Unparseable publish_page");
                return Ok(Vec::new());
            }
        };

        let mut articles = Vec::new();
        for item in page.publish_list {
            let info: PublishInfo = match serde_json::from_str(&item.publish_info) {
                Ok(info) => info,
                Err(e) => {
                    warn!(account = account_name, error = %e, "Unparseable publish_info entry");
                    continue;
                }
            };
            for msg in info.appmsgex {
                if msg.create_time == 0 || msg.link.is_empty() {
                    continue;
                }
                articles.push(DiscoveredArticle {
                    title: msg.title,
                    link: msg.link,
                    publish_time: minute_epoch_to_datetime(msg.create_time),
                });
                if articles.len() as u32 >= limit {
                    return Ok(articles);
                }
            }
        }
        Ok(articles)
    }
}

/// Classify a backend envelope. Expired-session messages and frequency
/// control each map to their own error kind; any other non-zero ret is the
/// caller's problem (typically treated as an empty result).
fn check_base_resp(base: Option<&BaseResp>, api: &str) -> Result<()> {
    let Some(base) = base else { return Ok(()) };
    let msg = base.err_msg.to_lowercase();

    if EXPIRED_MESSAGES.contains(&msg.as_str()) {
        warn!(api, ret = base.ret, err_msg = %base.err_msg, "WeChat credentials expired");
        return Err(ReprintError::CredentialsExpired(format!(
            "{api}: ret {}: {}",
            base.ret, base.err_msg
        )));
    }
    if msg.contains("freq control") {
        warn!(api, ret = base.ret, err_msg = %base.err_msg, "WeChat frequency control");
        return Err(ReprintError::RateLimited(format!(
            "{api}: ret {}: {}",
            base.ret, base.err_msg
        )));
    }
    if base.ret != 0 {
        warn!(api, ret = base.ret, err_msg = %base.err_msg, "WeChat API returned an error");
    }
    Ok(())
}

/// The list endpoint reports minute-granularity epochs relative to
/// 1970-01-01 08:00 local time.
pub fn minute_epoch_to_datetime(create_time: i64) -> NaiveDateTime {
    let epoch = NaiveDate::from_ymd_opt(1970, 1, 1)
        .unwrap()
        .and_hms_opt(8, 0, 0)
        .unwrap();
    epoch + chrono::Duration::minutes(create_time / 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth() -> WechatAuth {
        WechatAuth {
            token: "token123".into(),
            cookie: "session=abc".into(),
        }
    }

    fn publish_page_body() -> String {
        let publish_info = serde_json::json!({
            "appmsgex": [
                {"title": "第一篇", "link": "https://mp.weixin.qq.com/s/AAA", "create_time": 28512000},
                {"title": "第二篇", "link": "https://mp.weixin.qq.com/s/BBB", "create_time": 28512000}
            ]
        })
        .to_string();
        let publish_page = serde_json::json!({
            "publish_list": [{"publish_info": publish_info}]
        })
        .to_string();
        serde_json::json!({
            "base_resp": {"ret": 0, "err_msg": "ok"},
            "publish_page": publish_page
        })
        .to_string()
    }

    #[tokio::test]
    async fn lists_published_articles() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/cgi-bin/appmsgpublish")
            .match_query(mockito::Matcher::UrlEncoded(
                "fakeid".into(),
                "Mzg4MDcwNTQxMw==".into(),
            ))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(publish_page_body())
            .create_async()
            .await;

        let client = WechatClient::with_base_url(auth(), &server.url());
        let articles = client
            .list_published("舞林攻略指南", "Mzg4MDcwNTQxMw==", 10)
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(articles.len(), 2);
        assert_eq!(articles[0].title, "第一篇");
        assert_eq!(articles[0].link, "https://mp.weixin.qq.com/s/AAA");
        assert_eq!(
            articles[0].publish_time,
            minute_epoch_to_datetime(28512000)
        );
    }

    #[tokio::test]
    async fn limit_caps_results() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/cgi-bin/appmsgpublish")
            .match_query(mockito::Matcher::Any)
            .with_body(publish_page_body())
            .create_async()
            .await;

        let client = WechatClient::with_base_url(auth(), &server.url());
        let articles = client.list_published("acc", "fid", 1).await.unwrap();
        assert_eq!(articles.len(), 1);
    }

    #[tokio::test]
    async fn invalid_session_raises_credentials_expired() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/cgi-bin/appmsgpublish")
            .match_query(mockito::Matcher::Any)
            .with_body(r#"{"base_resp": {"ret": -18, "err_msg": "invalid session"}}"#)
            .create_async()
            .await;

        let client = WechatClient::with_base_url(auth(), &server.url());
        let err = client.list_published("acc", "fid", 5).await.unwrap_err();
        assert!(matches!(err, ReprintError::CredentialsExpired(_)));
        assert_eq!(err.exit_code(), 2);
    }

    #[tokio::test]
    async fn freq_control_raises_rate_limited() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/cgi-bin/appmsgpublish")
            .match_query(mockito::Matcher::Any)
            .with_body(
                r#"{"base_resp": {"ret": -8, "err_msg": "freq control please try again later"}}"#,
            )
            .create_async()
            .await;

        let client = WechatClient::with_base_url(auth(), &server.url());
        let err = client.list_published("acc", "fid", 5).await.unwrap_err();
        assert!(matches!(err, ReprintError::RateLimited(_)));
        assert_eq!(err.exit_code(), 3);
    }

    #[tokio::test]
    async fn other_nonzero_ret_yields_empty_result() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/cgi-bin/appmsgpublish")
            .match_query(mockito::Matcher::Any)
            .with_body(r#"{"base_resp": {"ret": 200003, "err_msg": "invalid args"}}"#)
            .create_async()
            .await;

        let client = WechatClient::with_base_url(auth(), &server.url());
        let articles = client.list_published("acc", "fid", 5).await.unwrap();
        assert!(articles.is_empty());
    }

    #[tokio::test]
    async fn empty_publish_list_yields_zero_articles() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/cgi-bin/appmsgpublish")
            .match_query(mockito::Matcher::Any)
            .with_body(
                serde_json::json!({
                    "base_resp": {"ret": 0, "err_msg": "ok"},
                    "publish_page": r#"{"publish_list": []}"#
                })
                .to_string(),
            )
            .create_async()
            .await;

        let client = WechatClient::with_base_url(auth(), &server.url());
        let articles = client.list_published("acc", "fid", 5).await.unwrap();
        assert!(articles.is_empty());
    }

    #[tokio::test]
    async fn search_biz_resolves_fakeid() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/cgi-bin/searchbiz")
            .match_query(mockito::Matcher::UrlEncoded(
                "query".into(),
                "舞林攻略指南".into(),
            ))
            .with_body(
                serde_json::json!({
                    "base_resp": {"ret": 0, "err_msg": "ok"},
                    "list": [
                        {"nickname": "别的号", "fakeid": "XXX"},
                        {"nickname": "舞林攻略指南", "fakeid": "Mzg4MDcwNTQxMw=="}
                    ]
                })
                .to_string(),
            )
            .create_async()
            .await;

        let client = WechatClient::with_base_url(auth(), &server.url());
        let fakeid = client.search_biz("舞林攻略指南").await.unwrap();
        assert_eq!(fakeid.as_deref(), Some("Mzg4MDcwNTQxMw=="));
    }

    #[test]
    fn minute_epoch_formula() {
        // 28512000 / 60 = 475200 minutes = exactly 330 days past
        // 1970-01-01 08:00.
        let dt = minute_epoch_to_datetime(28512000);
        let expected = NaiveDate::from_ymd_opt(1970, 11, 27)
            .unwrap()
            .and_hms_opt(8, 0, 0)
            .unwrap();
        assert_eq!(dt, expected);
    }
}
