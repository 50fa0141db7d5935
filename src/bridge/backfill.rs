use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use tracing::{debug, info, info_span, warn};
use tracing_futures::Instrument;

use super::error::BridgeError;
use super::platform::{HistorySource, Platform};
use super::router::{EventRouter, Link, StartPolicy};
use crate::db::CursorStore;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackfillReport {
    pub pages: usize,
    pub routed: usize,
    pub mirrored: usize,
    /// Another backfill of the same conversation was already running.
    pub skipped: bool,
}

pub struct BackfillEngine {
    router: Arc<EventRouter>,
    cursors: Arc<dyn CursorStore>,
    sources: HashMap<Platform, Arc<dyn HistorySource>>,
    page_size: usize,
    in_flight: Mutex<HashSet<String>>,
}

struct InFlight<'a> {
    set: &'a Mutex<HashSet<String>>,
    key: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.key);
    }
}

impl BackfillEngine {
    pub fn new(
        router: Arc<EventRouter>,
        cursors: Arc<dyn CursorStore>,
        sources: HashMap<Platform, Arc<dyn HistorySource>>,
        page_size: usize,
    ) -> Self {
        Self {
            router,
            cursors,
            sources,
            page_size: page_size.max(1),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn source(&self, platform: Platform) -> Option<Arc<dyn HistorySource>> {
        self.sources.get(&platform).cloned()
    }

    fn claim(&self, key: &str) -> Option<InFlight<'_>> {
        let mut set = self.in_flight.lock();
        if !set.insert(key.to_string()) {
            return None;
        }
        Some(InFlight {
            set: &self.in_flight,
            key: key.to_string(),
        })
    }

    pub async fn backfill(
        &self,
        link: Link,
        conversation_id: &str,
    ) -> Result<BackfillReport, BridgeError> {
        let key = link.scoped(conversation_id);
        let Some(_guard) = self.claim(&key) else {
            debug!("backfill already running key={}", key);
            return Ok(BackfillReport {
                skipped: true,
                ..BackfillReport::default()
            });
        };
        let Some(source) = self.source(link.source()) else {
            return Err(BridgeError::ConfigurationMissing(format!(
                "history source for {}",
                link.source()
            )));
        };
        let fetch_failure = |err: anyhow::Error| BridgeError::BackfillFetchFailure {
            conversation: key.clone(),
            reason: err.to_string(),
        };

        let mut cursor = self.cursors.cursor(&key).await?;
        if cursor.is_none() && link.start_policy() == StartPolicy::Latest {
            if let Some(head) = source
                .latest_cursor(conversation_id)
                .await
                .map_err(fetch_failure)?
            {
                self.cursors.put_cursor(&key, &head).await?;
                debug!("backfill seeded at head key={} cursor={}", key, head);
                cursor = Some(head);
            }
        }

        let mut report = BackfillReport::default();
        loop {
            let page = source
                .fetch_after(conversation_id, cursor.as_deref(), self.page_size)
                .await
                .map_err(fetch_failure)?;
            report.pages += 1;
            debug!(
                "backfill page key={} page={} fetched={} events={}",
                key,
                report.pages,
                page.fetched,
                page.events.len()
            );

            for event in page.events {
                match self.router.route(link, event).await {
                    Ok(outcome) => {
                        report.routed += 1;
                        if outcome.is_mirrored() {
                            report.mirrored += 1;
                        }
                    }
                    Err(BridgeError::Database(err)) => return Err(BridgeError::Database(err)),
                    Err(err) => warn!("backfill event dropped key={} error={}", key, err),
                }
            }

            let advanced = match page.next_cursor {
                Some(next) if page.fetched > 0 && cursor.as_deref() != Some(next.as_str()) => {
                    self.cursors.put_cursor(&key, &next).await?;
                    cursor = Some(next);
                    true
                }
                _ => false,
            };

            if page.fetched < self.page_size || !advanced {
                break;
            }
        }

        info!(
            "backfill finished key={} pages={} routed={} mirrored={}",
            key, report.pages, report.routed, report.mirrored
        );
        Ok(report)
    }

    /// Backfills distinct conversations concurrently; each one stays sequential.
    pub async fn backfill_all(&self, conversations: Vec<(Link, String)>) -> usize {
        let runs = conversations.into_iter().map(|(link, conversation_id)| {
            let span = info_span!("backfill", link = %link, conversation = %conversation_id);
            async move {
                match self.backfill(link, &conversation_id).await {
                    Ok(report) => report.mirrored,
                    Err(err) => {
                        warn!(
                            "backfill failed link={} conversation={} error={}",
                            link, conversation_id, err
                        );
                        0
                    }
                }
            }
            .instrument(span)
        });
        join_all(runs).await.into_iter().sum()
    }
}
