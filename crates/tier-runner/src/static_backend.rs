//! Backend that always gives the same answer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use coordination::{Backend, BackendError, BackendResult, Task};

pub struct StaticBackend {
    id: String,
    reply: Result<BackendResult, BackendError>,
    calls: AtomicU64,
}

impl StaticBackend {
    pub fn new(id: impl Into<String>, reply: Result<BackendResult, BackendError>) -> Self {
        Self {
            id: id.into(),
            reply,
            calls: AtomicU64::new(0),
        }
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Backend for StaticBackend {
    fn id(&self) -> &str {
        &self.id
    }

    async fn call(&self, _task: &Task, _timeout: Duration) -> Result<BackendResult, BackendError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.reply.clone()
    }
}
