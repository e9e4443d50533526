// Tenant-scoped operational topic (suspend, disconnect) consumed by managers.
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

const TOPIC_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TenantOperation {
    Suspend,
    Unsuspend,
    Disconnect,
}

pub fn topic(tenant_id: &str) -> String {
    format!("operations:{tenant_id}")
}

#[derive(Debug, Clone, Default)]
pub struct OperationsBus {
    topics: Arc<Mutex<HashMap<String, broadcast::Sender<TenantOperation>>>>,
}

impl OperationsBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, tenant_id: &str) -> broadcast::Receiver<TenantOperation> {
        self.topics
            .lock()
            .entry(topic(tenant_id))
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .subscribe()
    }

    /// Drops the tenant's topic once nobody is subscribed to it. Returns
    /// whether a topic was removed.
    pub fn release(&self, tenant_id: &str) -> bool {
        let key = topic(tenant_id);
        let mut topics = self.topics.lock();
        match topics.get(&key) {
            Some(sender) if sender.receiver_count() == 0 => topics.remove(&key).is_some(),
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.topics.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delivers `operation` to every subscriber of the tenant's topic and
    /// returns how many received it. Topics without subscribers are dropped.
    pub fn publish(&self, tenant_id: &str, operation: TenantOperation) -> usize {
        let key = topic(tenant_id);
        let mut topics = self.topics.lock();
        let Some(sender) = topics.get(&key) else {
            return 0;
        };
        match sender.send(operation) {
            Ok(delivered) => {
                tracing::debug!(tenant_id = %tenant_id, ?operation, delivered, "tenant operation published");
                delivered
            }
            Err(_) => {
                topics.remove(&key);
                0
            }
        }
    }
}
