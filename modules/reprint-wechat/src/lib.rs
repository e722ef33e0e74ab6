//! Link discovery from the WeChat Official Accounts backend.
//!
//! The backend is consumed with a token+cookie pair produced by an external
//! login flow. Two endpoints are used: `searchbiz` to resolve an account's
//! fakeid, and `appmsgpublish` to enumerate its recent articles.

pub mod client;
pub mod discovery;

pub use client::{WechatAuth, WechatClient};
pub use discovery::{FakeidCache, LinkDiscoverer};
