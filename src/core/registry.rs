//! Process-wide call registry.
//!
//! Maps call ids to live [`CallHandle`]s and carries the bookkeeping that
//! makes teardown safe under concurrent events: the external-leg to call
//! mapping, an at-most-once cleanup cell per call, a hard suppression set
//! for already-cleaned ids and a short-lived ignore list for external legs
//! the bridge hung up itself.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::OnceCell;

use super::call::CallHandle;

/// How long an external leg id stays on the ignore list after the bridge
/// hangs it up; its StasisEnd/ChannelDestroyed echoes arrive well within.
const IGNORE_EXTERNAL_FOR: Duration = Duration::from_secs(10);

/// Polling schedule for the external-leg enter handler waiting on the
/// external-to-call mapping.
const MAPPING_WAIT_ATTEMPTS: u32 = 10;
const MAPPING_WAIT_STEP: Duration = Duration::from_millis(50);

#[derive(Default)]
pub struct CallRegistry {
    calls: Mutex<HashMap<String, Arc<CallHandle>>>,
    external_to_call: Mutex<HashMap<String, String>>,
    cleaned: Mutex<HashSet<String>>,
    ignored_external: Mutex<HashMap<String, Instant>>,
    cleanups: Mutex<HashMap<String, Arc<OnceCell<()>>>>,
}

impl CallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, handle: Arc<CallHandle>) {
        self.calls.lock().insert(handle.id.clone(), handle);
    }

    pub fn get(&self, call_id: &str) -> Option<Arc<CallHandle>> {
        self.calls.lock().get(call_id).cloned()
    }

    pub fn contains(&self, call_id: &str) -> bool {
        self.calls.lock().contains_key(call_id)
    }

    /// Remove the call and suppress all later events for its id.
    pub fn remove_and_mark_cleaned(&self, call_id: &str) -> Option<Arc<CallHandle>> {
        self.cleaned.lock().insert(call_id.to_string());
        self.calls.lock().remove(call_id)
    }

    pub fn is_cleaned(&self, call_id: &str) -> bool {
        self.cleaned.lock().contains(call_id)
    }

    pub fn call_ids(&self) -> Vec<String> {
        self.calls.lock().keys().cloned().collect()
    }

    pub fn live_calls(&self) -> Vec<Arc<CallHandle>> {
        self.calls.lock().values().cloned().collect()
    }

    /// Find the call owning a bridge.
    pub async fn find_by_bridge(&self, bridge_id: &str) -> Option<Arc<CallHandle>> {
        for handle in self.live_calls() {
            if handle.state.lock().await.bridge_id == bridge_id {
                return Some(handle);
            }
        }
        None
    }

    // -------------------------------------------------------------------------
    // External leg mapping
    // -------------------------------------------------------------------------

    pub fn map_external(&self, external_id: &str, call_id: &str) {
        self.external_to_call
            .lock()
            .insert(external_id.to_string(), call_id.to_string());
    }

    pub fn resolve_external(&self, external_id: &str) -> Option<String> {
        self.external_to_call.lock().get(external_id).cloned()
    }

    pub fn unmap_external(&self, external_id: &str) {
        self.external_to_call.lock().remove(external_id);
    }

    /// Bounded wait for the orchestrator to have published the external-leg
    /// mapping; the StasisStart of the external-media channel can overtake
    /// the originate response.
    pub async fn wait_external_mapping(&self, external_id: &str) -> Option<String> {
        for attempt in 0..MAPPING_WAIT_ATTEMPTS {
            if let Some(call_id) = self.resolve_external(external_id) {
                return Some(call_id);
            }
            if attempt + 1 < MAPPING_WAIT_ATTEMPTS {
                tokio::time::sleep(MAPPING_WAIT_STEP).await;
            }
        }
        None
    }

    /// Suppress events for an external leg the bridge is hanging up itself.
    pub fn ignore_external_leg(&self, external_id: &str) {
        let mut ignored = self.ignored_external.lock();
        let now = Instant::now();
        ignored.retain(|_, since| now.duration_since(*since) < IGNORE_EXTERNAL_FOR);
        ignored.insert(external_id.to_string(), now);
    }

    pub fn is_external_ignored(&self, external_id: &str) -> bool {
        let ignored = self.ignored_external.lock();
        ignored
            .get(external_id)
            .is_some_and(|since| since.elapsed() < IGNORE_EXTERNAL_FOR)
    }

    // -------------------------------------------------------------------------
    // Cleanup serialization
    // -------------------------------------------------------------------------

    /// The at-most-once cell guarding this call's cleanup. Concurrent callers
    /// get the same cell; whoever initializes it first runs the teardown and
    /// everyone else awaits that run.
    pub fn cleanup_cell(&self, call_id: &str) -> Arc<OnceCell<()>> {
        self.cleanups
            .lock()
            .entry(call_id.to_string())
            .or_default()
            .clone()
    }

    /// Drop the cleanup cell once teardown finished; the cleaned set takes
    /// over suppression from here.
    pub fn drop_cleanup_cell(&self, call_id: &str) {
        self.cleanups.lock().remove(call_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cleaned_set_suppresses() {
        let registry = CallRegistry::new();
        assert!(!registry.is_cleaned("c1"));
        registry.remove_and_mark_cleaned("c1");
        assert!(registry.is_cleaned("c1"));
    }

    #[tokio::test]
    async fn external_mapping_wait_resolves_late_insert() {
        let registry = Arc::new(CallRegistry::new());
        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.wait_external_mapping("ext-1").await })
        };
        tokio::time::sleep(Duration::from_millis(120)).await;
        registry.map_external("ext-1", "c1");
        assert_eq!(waiter.await.unwrap(), Some("c1".to_string()));

        assert_eq!(registry.wait_external_mapping("ext-missing").await, None);
    }

    #[test]
    fn ignore_list_expires_by_time() {
        let registry = CallRegistry::new();
        registry.ignore_external_leg("ext-1");
        assert!(registry.is_external_ignored("ext-1"));
        assert!(!registry.is_external_ignored("ext-2"));
    }

    #[tokio::test]
    async fn cleanup_cell_runs_once_and_joiners_wait() {
        let registry = Arc::new(CallRegistry::new());
        let counter = Arc::new(std::sync::atomic::AtomicU32::new(0));

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let registry = registry.clone();
            let counter = counter.clone();
            tasks.push(tokio::spawn(async move {
                let cell = registry.cleanup_cell("c1");
                cell.get_or_init(|| async {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                })
                .await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
