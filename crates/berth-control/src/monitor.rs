use std::{collections::HashMap, sync::Mutex};

use berth_lifecycle::BotId;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

/// One in-flight readiness watch.
#[derive(Debug, Clone)]
pub struct MonitorHandle {
    pub task_id: u64,
    pub bot_id: BotId,
    pub container_ref: String,
    pub tenant_id: String,
    pub started_at: DateTime<Utc>,
    pub(crate) cancel: CancellationToken,
}

impl MonitorHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Active watches, at most one per bot.
pub trait MonitorRegistry: Send + Sync {
    fn get(&self, bot_id: &BotId) -> Option<MonitorHandle>;
    /// Inserts `handle`, returning whichever watch it displaced.
    fn set(&self, handle: MonitorHandle) -> Option<MonitorHandle>;
    fn remove(&self, bot_id: &BotId) -> Option<MonitorHandle>;
    /// Removes the entry only if it still belongs to `task_id`.
    fn remove_task(&self, bot_id: &BotId, task_id: u64) -> bool;
    fn drain(&self) -> Vec<MonitorHandle>;
    fn len(&self) -> usize;

    fn has(&self, bot_id: &BotId) -> bool {
        self.get(bot_id).is_some()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Default)]
pub struct InMemoryMonitorRegistry {
    inner: Mutex<HashMap<BotId, MonitorHandle>>,
}

impl InMemoryMonitorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<BotId, MonitorHandle>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl MonitorRegistry for InMemoryMonitorRegistry {
    fn get(&self, bot_id: &BotId) -> Option<MonitorHandle> {
        self.lock().get(bot_id).cloned()
    }

    fn set(&self, handle: MonitorHandle) -> Option<MonitorHandle> {
        self.lock().insert(handle.bot_id, handle)
    }

    fn remove(&self, bot_id: &BotId) -> Option<MonitorHandle> {
        self.lock().remove(bot_id)
    }

    fn remove_task(&self, bot_id: &BotId, task_id: u64) -> bool {
        let mut map = self.lock();
        if map.get(bot_id).is_some_and(|h| h.task_id == task_id) {
            map.remove(bot_id);
            true
        } else {
            false
        }
    }

    fn drain(&self) -> Vec<MonitorHandle> {
        self.lock().drain().map(|(_, h)| h).collect()
    }

    fn len(&self) -> usize {
        self.lock().len()
    }
}
