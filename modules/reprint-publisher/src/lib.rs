//! Republishing completed articles into a Discuz forum by direct row
//! insertion, all-or-nothing per article.

pub mod batch;
pub mod discuz;

pub use batch::{BatchPublisher, PublishSummary};
pub use discuz::{DiscuzPublisher, PublishedIds};
