//! HTTP 传输引擎
//!
//! 每个传输由一个后台 worker 流式写入目标文件：
//! - 暂停：取消 worker，保留已接收字节数
//! - 恢复：带 `Range: bytes={offset}-` 重新请求；服务器不支持断点时从头下载
//! - 取消：停止 worker 并从存活表中移除

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::header::RANGE;
use reqwest::{Client, StatusCode, Url};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    EngineError, SpeedMeter, TransferEngine, TransferOperation, TransferProgress, TransferState,
};

type LiveTable = DashMap<String, Arc<HttpTransfer>>;

/// HTTP 传输引擎
pub struct HttpTransferEngine {
    client: Client,
    live: Arc<LiveTable>,
}

impl HttpTransferEngine {
    pub fn new() -> Result<Self, EngineError> {
        let client = Client::builder()
            .user_agent(concat!("download-registry/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self::with_client(client))
    }

    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            live: Arc::new(DashMap::new()),
        }
    }

    /// 存活传输数量
    pub fn live_count(&self) -> usize {
        self.live.len()
    }
}

#[async_trait]
impl TransferEngine for HttpTransferEngine {
    async fn submit(
        &self,
        uri: &str,
        destination: &Path,
    ) -> Result<Arc<dyn TransferOperation>, EngineError> {
        let url = Url::parse(uri).map_err(|e| EngineError::InvalidUri(format!("{}: {}", uri, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(EngineError::InvalidUri(format!("不支持的协议: {}", url.scheme())));
        }

        let transfer = Arc::new(HttpTransfer {
            id: Uuid::new_v4().to_string(),
            url,
            destination: destination.to_path_buf(),
            client: self.client.clone(),
            live: Arc::downgrade(&self.live),
            status: Arc::new(Mutex::new(TransferStatus::default())),
            worker: Mutex::new(None),
        });

        self.live.insert(transfer.id.clone(), Arc::clone(&transfer));
        info!("已提交 HTTP 传输: id={}, url={}", transfer.id, transfer.url);

        Ok(transfer as Arc<dyn TransferOperation>)
    }

    async fn enumerate_live(&self) -> Result<Vec<Arc<dyn TransferOperation>>, EngineError> {
        Ok(self
            .live
            .iter()
            .map(|entry| Arc::clone(entry.value()) as Arc<dyn TransferOperation>)
            .collect())
    }
}

/// 传输内部状态
#[derive(Debug)]
struct TransferStatus {
    state: TransferState,
    bytes_received: u64,
    total_bytes: Option<u64>,
    error: Option<String>,
    meter: SpeedMeter,
}

impl Default for TransferStatus {
    fn default() -> Self {
        Self {
            state: TransferState::Idle,
            bytes_received: 0,
            total_bytes: None,
            error: None,
            meter: SpeedMeter::default(),
        }
    }
}

struct Worker {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// 单个 HTTP 传输
pub struct HttpTransfer {
    id: String,
    url: Url,
    destination: PathBuf,
    client: Client,
    live: Weak<LiveTable>,
    status: Arc<Mutex<TransferStatus>>,
    worker: Mutex<Option<Worker>>,
}

impl HttpTransfer {
    fn state(&self) -> TransferState {
        self.status.lock().state
    }

    fn spawn_worker(&self) {
        {
            let mut status = self.status.lock();
            status.state = TransferState::Running;
            status.error = None;
        }

        let token = CancellationToken::new();
        let handle = tokio::spawn(run_worker(
            self.id.clone(),
            self.client.clone(),
            self.url.clone(),
            self.destination.clone(),
            Arc::clone(&self.status),
            token.clone(),
        ));

        *self.worker.lock() = Some(Worker { token, handle });
    }

    /// 停止 worker 并等待其退出
    async fn stop_worker(&self) {
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            worker.token.cancel();
            if let Err(e) = worker.handle.await {
                warn!("传输 worker 异常退出: id={}, 错误: {}", self.id, e);
            }
        }
        self.status.lock().meter.reset();
    }

    fn invalid(&self, command: &'static str) -> EngineError {
        EngineError::InvalidState {
            id: self.id.clone(),
            state: self.state(),
            command,
        }
    }
}

#[async_trait]
impl TransferOperation for HttpTransfer {
    fn id(&self) -> &str {
        &self.id
    }

    fn progress(&self) -> TransferProgress {
        let mut status = self.status.lock();
        let speed = if status.state == TransferState::Running {
            status.meter.speed()
        } else {
            0
        };
        TransferProgress {
            state: status.state,
            bytes_received: status.bytes_received,
            total_bytes: status.total_bytes,
            bytes_received_speed: speed,
            error: status.error.clone(),
        }
    }

    async fn start(&self) -> Result<(), EngineError> {
        match self.state() {
            TransferState::Idle => {
                self.spawn_worker();
                Ok(())
            }
            TransferState::Running => Ok(()),
            _ => Err(self.invalid("start")),
        }
    }

    async fn pause(&self) -> Result<(), EngineError> {
        match self.state() {
            TransferState::Running | TransferState::Idle => {
                self.stop_worker().await;
                let mut status = self.status.lock();
                // worker 可能恰好在取消前结束
                if !status.state.is_final() {
                    status.state = TransferState::Paused;
                }
                debug!("传输已暂停: id={}", self.id);
                Ok(())
            }
            TransferState::Paused => Ok(()),
            _ => Err(self.invalid("pause")),
        }
    }

    async fn resume(&self) -> Result<(), EngineError> {
        match self.state() {
            TransferState::Paused | TransferState::Idle => {
                self.spawn_worker();
                debug!("传输已恢复: id={}", self.id);
                Ok(())
            }
            TransferState::Running => Ok(()),
            _ => Err(self.invalid("resume")),
        }
    }

    async fn cancel(&self) -> Result<(), EngineError> {
        self.stop_worker().await;
        {
            let mut status = self.status.lock();
            if !status.state.is_final() {
                status.state = TransferState::Canceled;
            }
        }

        if let Some(live) = self.live.upgrade() {
            live.remove(&self.id);
        }
        info!("传输已取消: id={}", self.id);
        Ok(())
    }
}

async fn run_worker(
    id: String,
    client: Client,
    url: Url,
    destination: PathBuf,
    status: Arc<Mutex<TransferStatus>>,
    token: CancellationToken,
) {
    let result = tokio::select! {
        r = download(&client, &url, &destination, &status) => r,
        _ = token.cancelled() => {
            debug!("传输 worker 收到取消信号: id={}", id);
            return;
        }
    };

    let mut st = status.lock();
    st.meter.reset();
    match result {
        Ok(()) => {
            st.state = TransferState::Completed;
            info!("传输完成: id={}, 大小={} bytes", id, st.bytes_received);
        }
        Err(e) => {
            warn!("传输失败: id={}, 错误: {}", id, e);
            st.state = TransferState::Error;
            st.error = Some(e.to_string());
        }
    }
}

/// 流式下载到目标文件，从已接收位置续传
async fn download(
    client: &Client,
    url: &Url,
    destination: &Path,
    status: &Mutex<TransferStatus>,
) -> Result<(), EngineError> {
    let offset = status.lock().bytes_received;

    let mut request = client.get(url.clone());
    if offset > 0 {
        request = request.header(RANGE, format!("bytes={}-", offset));
    }
    let resp = request.send().await?.error_for_status()?;

    let resumed = offset > 0 && resp.status() == StatusCode::PARTIAL_CONTENT;

    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .open(destination)
        .await?;

    if resumed {
        file.seek(SeekFrom::Start(offset)).await?;
    } else {
        // 服务器不支持断点续传，从头开始
        if offset > 0 {
            debug!("服务器未返回 206，从头下载: {}", url);
        }
        file.set_len(0).await?;
        status.lock().bytes_received = 0;
    }

    {
        let mut st = status.lock();
        st.total_bytes = resp
            .content_length()
            .map(|len| if resumed { len + offset } else { len });
        let received = st.bytes_received;
        st.meter.record(received);
    }

    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;

        let mut st = status.lock();
        st.bytes_received += chunk.len() as u64;
        let received = st.bytes_received;
        st.meter.record(received);
    }

    file.flush().await?;
    Ok(())
}
