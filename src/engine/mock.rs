//! 测试用引擎：不做网络 I/O，可注入失败

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use super::{EngineError, TransferEngine, TransferOperation, TransferProgress, TransferState};

type LiveList = Mutex<Vec<Arc<MockTransfer>>>;

#[derive(Default)]
pub(crate) struct MockEngine {
    live: Arc<LiveList>,
    fail_submit: AtomicBool,
    fail_enumerate: AtomicBool,
    pub submitted: AtomicUsize,
}

impl MockEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_fail_submit(&self, fail: bool) {
        self.fail_submit.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_enumerate(&self, fail: bool) {
        self.fail_enumerate.store(fail, Ordering::SeqCst);
    }

    /// 模拟引擎重启：所有存活传输消失
    pub fn forget_all(&self) {
        self.live.lock().clear();
    }

    pub fn get(&self, id: &str) -> Option<Arc<MockTransfer>> {
        self.live.lock().iter().find(|t| t.id == id).cloned()
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().len()
    }
}

#[async_trait]
impl TransferEngine for MockEngine {
    async fn submit(
        &self,
        uri: &str,
        destination: &Path,
    ) -> Result<Arc<dyn TransferOperation>, EngineError> {
        if self.fail_submit.load(Ordering::SeqCst) {
            return Err(EngineError::Submit(format!("模拟提交失败: {}", uri)));
        }
        self.submitted.fetch_add(1, Ordering::SeqCst);

        let transfer = Arc::new(MockTransfer {
            id: Uuid::new_v4().to_string(),
            destination: destination.to_path_buf(),
            live: Arc::downgrade(&self.live),
            state: Mutex::new(TransferState::Idle),
            speed: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            fail_resume: AtomicBool::new(false),
            fail_pause: AtomicBool::new(false),
            resume_calls: AtomicUsize::new(0),
            pause_calls: AtomicUsize::new(0),
        });
        self.live.lock().push(Arc::clone(&transfer));
        Ok(transfer as Arc<dyn TransferOperation>)
    }

    async fn enumerate_live(&self) -> Result<Vec<Arc<dyn TransferOperation>>, EngineError> {
        if self.fail_enumerate.load(Ordering::SeqCst) {
            return Err(EngineError::Submit("模拟枚举失败".to_string()));
        }
        Ok(self
            .live
            .lock()
            .iter()
            .map(|t| Arc::clone(t) as Arc<dyn TransferOperation>)
            .collect())
    }
}

pub(crate) struct MockTransfer {
    pub id: String,
    pub destination: PathBuf,
    live: Weak<LiveList>,
    state: Mutex<TransferState>,
    speed: AtomicU64,
    bytes_received: AtomicU64,
    fail_resume: AtomicBool,
    fail_pause: AtomicBool,
    pub resume_calls: AtomicUsize,
    pub pause_calls: AtomicUsize,
}

impl MockTransfer {
    pub fn set_state(&self, state: TransferState) {
        *self.state.lock() = state;
    }

    pub fn set_speed(&self, speed: u64) {
        self.speed.store(speed, Ordering::SeqCst);
    }

    pub fn set_bytes_received(&self, bytes: u64) {
        self.bytes_received.store(bytes, Ordering::SeqCst);
    }

    pub fn set_fail_resume(&self, fail: bool) {
        self.fail_resume.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_pause(&self, fail: bool) {
        self.fail_pause.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl TransferOperation for MockTransfer {
    fn id(&self) -> &str {
        &self.id
    }

    fn progress(&self) -> TransferProgress {
        let state = *self.state.lock();
        TransferProgress {
            state,
            bytes_received: self.bytes_received.load(Ordering::SeqCst),
            total_bytes: None,
            bytes_received_speed: if state == TransferState::Running {
                self.speed.load(Ordering::SeqCst)
            } else {
                0
            },
            error: None,
        }
    }

    async fn start(&self) -> Result<(), EngineError> {
        self.set_state(TransferState::Running);
        Ok(())
    }

    async fn pause(&self) -> Result<(), EngineError> {
        self.pause_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_pause.load(Ordering::SeqCst) {
            return Err(EngineError::Submit("模拟暂停失败".to_string()));
        }
        self.set_state(TransferState::Paused);
        Ok(())
    }

    async fn resume(&self) -> Result<(), EngineError> {
        self.resume_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_resume.load(Ordering::SeqCst) {
            return Err(EngineError::Submit("模拟恢复失败".to_string()));
        }
        self.set_state(TransferState::Running);
        Ok(())
    }

    async fn cancel(&self) -> Result<(), EngineError> {
        self.set_state(TransferState::Canceled);
        if let Some(live) = self.live.upgrade() {
            live.lock().retain(|t| t.id != self.id);
        }
        Ok(())
    }
}
