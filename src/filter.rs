//! Keyword exclusion and order-amount filtering
//!
//! The filter predicate evaluated against every inbound message: excluded
//! keywords reject a message outright, otherwise the order amount is
//! extracted and compared against the configured threshold. Keywords are
//! fetched fresh on every evaluation so runtime edits take effect
//! immediately.

use async_trait::async_trait;
use lazy_regex::regex;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Supplies the mutable set of excluded keywords.
///
/// Implementations must tolerate concurrent reads; the pipeline never caches
/// the returned list across events.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FilterRuleSource: Send + Sync {
    /// Current excluded keywords, in storage order
    async fn excluded_keywords(&self) -> Vec<String>;
}

/// In-memory rule source with runtime-editable keywords.
///
/// Stands in for the keyword CRUD storage when no external backend is wired
/// up, and backs tests that exercise the fresh-read contract.
#[derive(Default)]
pub struct InMemoryRuleSource {
    keywords: RwLock<Vec<String>>,
}

impl InMemoryRuleSource {
    /// Create a source preloaded with the given keywords
    #[must_use]
    pub fn with_keywords(keywords: Vec<String>) -> Self {
        Self {
            keywords: RwLock::new(keywords),
        }
    }

    /// Replace the keyword list
    pub async fn set_keywords(&self, keywords: Vec<String>) {
        *self.keywords.write().await = keywords;
    }
}

#[async_trait]
impl FilterRuleSource for InMemoryRuleSource {
    async fn excluded_keywords(&self) -> Vec<String> {
        self.keywords.read().await.clone()
    }
}

/// Extract the order amount from message text.
///
/// Two layouts are accepted: the bold markup variant
/// `**Сумма заказа:** 15000` and the plain `Сумма заказа: 15000`.
/// Returns `None` when neither matches or the number does not fit.
#[must_use]
pub fn extract_order_amount(text: &str) -> Option<u64> {
    let bold = regex!(r"\*\*Сумма заказа:\*\*\s*(\d+)");
    let plain = regex!(r"Сумма заказа:\s*(\d+)");

    bold.captures(text)
        .or_else(|| plain.captures(text))
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// The filter predicate combining keyword exclusion with the amount threshold
pub struct OrderFilter {
    rules: Arc<dyn FilterRuleSource>,
    threshold: u64,
}

impl OrderFilter {
    /// Create a filter reading keywords from `rules` with the given
    /// order-amount threshold
    pub fn new(rules: Arc<dyn FilterRuleSource>, threshold: u64) -> Self {
        Self { rules, threshold }
    }

    /// Whether the message text passes the filter.
    ///
    /// Rejects when any non-empty keyword occurs in the text
    /// (case-insensitive substring), or when no order amount can be parsed,
    /// or when the amount does not strictly exceed the threshold.
    pub async fn accepts(&self, text: &str) -> bool {
        let lowered = text.to_lowercase();
        for keyword in self.rules.excluded_keywords().await {
            let keyword = keyword.trim();
            if !keyword.is_empty() && lowered.contains(&keyword.to_lowercase()) {
                warn!("message contains excluded keyword: {}", keyword);
                return false;
            }
        }

        match extract_order_amount(text) {
            Some(amount) => {
                debug!(amount, threshold = self.threshold, "order amount parsed");
                amount > self.threshold
            }
            None => {
                info!("message does not contain an order amount");
                false
            }
        }
    }
}
