//! 下载任务登记器
//!
//! 持久化存储中的任务记录是唯一事实来源；引擎中的存活传输只是附着在记录上的"运行时部分"。
//!
//! ## 并发
//!
//! 除 `initialize` 外，所有操作（包括后台 UI 刷新）都在同一把异步锁内串行执行，
//! 因此同时添加多个任务不会得到重名文件，刷新也不会与删除交错。
//! 单任务命令（暂停/恢复/取消）同样在锁内作用于当前集合中的句柄并立即写回，
//! 列表重建不会把已写回的终态冲掉。
//!
//! ## 崩溃窗口
//!
//! 添加任务时先创建文件、提交传输，最后写入记录。添加被中断时文件会删除、
//! 传输会在后台取消；写入记录前进程崩溃则会留下一个空文件和一个引擎中的孤儿传输，
//! 下次对账时不会出现在列表中。

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use super::collection::{TaskCollection, TaskListView};
use super::error::RegistryError;
use super::events::RegistryEvent;
use super::handle::{TaskHandle, TaskSnapshot};
use super::reconcile::reconcile;
use super::record::{TaskRecord, TaskStatus};
use super::refresh::{refresh_pass, RefreshScheduler, RefreshSummary};
use crate::access::{FolderAccessResolver, FolderHandle};
use crate::engine::{TransferEngine, TransferOperation};
use crate::store::{RecordNamespace, RecordStore, ROOT_NAMESPACE, TASKS_NAMESPACE};

/// 登记器版本
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// 根命名空间中最近使用目录的键
pub const LAST_USED_FOLDER_KEY: &str = "LastusedFolder";

/// 根命名空间中默认目录的键
pub const DEFAULT_FOLDER_KEY: &str = "DefaultFolder";

const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(1);

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// 初始化选项
#[derive(Debug, Clone)]
pub struct RegistryOptions {
    /// 是否启动 UI 刷新
    pub enable_ui_refresh: bool,
    /// UI 刷新周期
    pub refresh_interval: Duration,
}

impl RegistryOptions {
    pub fn new(enable_ui_refresh: bool) -> Self {
        Self {
            enable_ui_refresh,
            ..Self::default()
        }
    }
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            enable_ui_refresh: true,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
        }
    }
}

/// 锁内状态
pub(crate) struct RegistryState {
    pub(crate) collection: TaskCollection,
    pub(crate) root: Arc<dyn RecordNamespace>,
    pub(crate) tasks: Arc<dyn RecordNamespace>,
    pub(crate) last_used_folder: Option<FolderHandle>,
    pub(crate) default_folder: Option<FolderHandle>,
}

impl RegistryState {
    /// 写回单个任务记录，失败只记录警告
    fn persist(&self, task: &TaskHandle) {
        if let Err(e) = self.tasks.put(task.id(), task.record().to_stored()) {
            warn!("写回任务记录失败: {}, 错误: {}", task.id(), e);
        }
    }
}

/// 登记器与后台刷新共享的部分
pub(crate) struct RegistryShared {
    pub(crate) state: Mutex<RegistryState>,
    pub(crate) engine: Arc<dyn TransferEngine>,
    pub(crate) resolver: Arc<dyn FolderAccessResolver>,
    pub(crate) download_bandwidth: AtomicU64,
    pub(crate) events: broadcast::Sender<RegistryEvent>,
}

impl RegistryShared {
    pub(crate) fn emit(&self, event: RegistryEvent) {
        // 没有订阅者时发送失败，忽略
        let _ = self.events.send(event);
    }
}

/// 新建文件的清理守卫：未解除前被丢弃则删除文件
struct CreatedFileGuard {
    path: Option<PathBuf>,
}

impl CreatedFileGuard {
    fn new(path: PathBuf) -> Self {
        Self { path: Some(path) }
    }

    fn disarm(mut self) {
        self.path = None;
    }
}

impl Drop for CreatedFileGuard {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!("已删除未完成登记的文件: {:?}", path),
                Err(e) => warn!("删除未完成登记的文件失败: {:?}, 错误: {}", path, e),
            }
        }
    }
}

/// 已提交传输的清理守卫：未解除前被丢弃则在后台取消传输
struct SubmittedTransferGuard {
    operation: Option<Arc<dyn TransferOperation>>,
}

impl SubmittedTransferGuard {
    fn new(operation: Arc<dyn TransferOperation>) -> Self {
        Self {
            operation: Some(operation),
        }
    }

    fn disarm(mut self) {
        self.operation = None;
    }

    /// 立即取消并等待结果
    async fn cancel(mut self) {
        if let Some(operation) = self.operation.take() {
            cancel_quietly(operation.as_ref()).await;
        }
    }
}

impl Drop for SubmittedTransferGuard {
    fn drop(&mut self) {
        let Some(operation) = self.operation.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                debug!("添加任务被中断，后台取消传输: {}", operation.id());
                runtime.spawn(async move {
                    cancel_quietly(operation.as_ref()).await;
                });
            }
            Err(_) => warn!("运行时已关闭，无法取消传输: {}", operation.id()),
        }
    }
}

/// 单个任务命令
#[derive(Debug, Clone, Copy)]
enum TaskCommand {
    Pause,
    Resume,
    Cancel,
}

/// 下载任务登记器
pub struct TaskRegistry {
    shared: Arc<RegistryShared>,
    refresh: Mutex<RefreshScheduler>,
}

impl TaskRegistry {
    /// 初始化登记器
    ///
    /// 打开根命名空间和 `Tasks` 命名空间，恢复最近使用目录和默认目录。
    /// 令牌已失效的目录会从存储中移除；存储不可用时返回 `Initialization`。
    pub async fn initialize(
        store: &dyn RecordStore,
        engine: Arc<dyn TransferEngine>,
        resolver: Arc<dyn FolderAccessResolver>,
        options: RegistryOptions,
    ) -> Result<Self, RegistryError> {
        info!("初始化下载任务登记器 v{}", VERSION);

        let root = store
            .open_namespace(ROOT_NAMESPACE)
            .map_err(RegistryError::Initialization)?;
        let tasks = store
            .open_namespace(TASKS_NAMESPACE)
            .map_err(RegistryError::Initialization)?;

        let last_used_folder =
            restore_folder(root.as_ref(), resolver.as_ref(), LAST_USED_FOLDER_KEY).await?;
        let default_folder =
            restore_folder(root.as_ref(), resolver.as_ref(), DEFAULT_FOLDER_KEY).await?;

        // 预先对账一次，批量操作在第一次列表前也能生效
        let collection =
            match reconcile(engine.as_ref(), tasks.as_ref(), resolver.as_ref(), 1).await {
                Ok((collection, stats)) => {
                    info!(
                        "已恢复 {} 个任务（{} 个关联到存活传输）",
                        stats.records, stats.attached
                    );
                    collection
                }
                Err(e) => {
                    warn!("启动对账失败，任务列表暂为空: {}", e);
                    TaskCollection::default()
                }
            };

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let shared = Arc::new(RegistryShared {
            state: Mutex::new(RegistryState {
                collection,
                root,
                tasks,
                last_used_folder,
                default_folder,
            }),
            engine,
            resolver,
            download_bandwidth: AtomicU64::new(0),
            events,
        });

        let mut refresh = RefreshScheduler::new(options.refresh_interval);
        if options.enable_ui_refresh {
            refresh.start(Arc::clone(&shared));
        }

        Ok(Self {
            shared,
            refresh: Mutex::new(refresh),
        })
    }

    pub fn version() -> &'static str {
        VERSION
    }

    /// 订阅登记器事件
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.shared.events.subscribe()
    }

    /// 列出任务
    ///
    /// 每次调用都按持久化记录重新对账，返回只读视图；
    /// `filter` 非空时只保留文件名包含该子串（不区分大小写）的任务
    pub async fn list_tasks(&self, filter: &str) -> Result<TaskListView, RegistryError> {
        let mut state = self.shared.state.lock().await;
        let generation = state.collection.generation() + 1;

        let (collection, _) = reconcile(
            self.shared.engine.as_ref(),
            state.tasks.as_ref(),
            self.shared.resolver.as_ref(),
            generation,
        )
        .await?;
        collection.inherit_from(&state.collection);
        state.collection = collection;

        Ok(state.collection.view(filter))
    }

    /// 按 ID 查找当前集合中的任务
    pub async fn find_task(&self, id: &str) -> Option<TaskHandle> {
        let state = self.shared.state.lock().await;
        state.collection.find(id).map(|(_, task)| task.clone())
    }

    /// 单个任务的最新快照
    ///
    /// 在锁内按引擎状态刷新，有变化时照常发出更新事件
    pub async fn task_snapshot(&self, id: &str) -> Option<TaskSnapshot> {
        let state = self.shared.state.lock().await;
        let (_, task) = state.collection.find(id)?;
        if task.refresh_from_live().changed {
            self.shared.emit(RegistryEvent::TaskUpdated {
                task: task.snapshot(),
            });
        }
        Some(task.snapshot())
    }

    /// 添加下载任务
    ///
    /// 在 `save_folder` 中创建目标文件（重名时自动编号），提交传输，
    /// 写入状态为 Queued 的记录后开始传输。任何一步失败都不会留下记录或文件。
    pub async fn add_task(
        &self,
        source_uri: &str,
        desired_file_name: &str,
        save_folder: &FolderHandle,
    ) -> Result<TaskHandle, RegistryError> {
        let mut state = self.shared.state.lock().await;

        let created = save_folder
            .create_unique_file(desired_file_name)
            .await
            .map_err(|e| {
                RegistryError::Creation(format!(
                    "无法在 {:?} 创建文件 {}: {}",
                    save_folder.path(),
                    desired_file_name,
                    e
                ))
            })?;
        let guard = CreatedFileGuard::new(created.path.clone());

        let operation = self
            .shared
            .engine
            .submit(source_uri, &created.path)
            .await
            .map_err(|e| RegistryError::Creation(format!("提交传输失败: {}", e)))?;
        let submitted = SubmittedTransferGuard::new(Arc::clone(&operation));

        let token = match self.shared.resolver.add_token(save_folder).await {
            Ok(token) => token,
            Err(e) => {
                submitted.cancel().await;
                return Err(e.into());
            }
        };

        let record = TaskRecord::new(source_uri, created.name.as_str(), token.as_str(), operation.id());
        if let Err(e) = state.tasks.put(record.id(), record.to_stored()) {
            submitted.cancel().await;
            return Err(e.into());
        }
        submitted.disarm();
        guard.disarm();

        if let Err(e) = state.root.put_string(LAST_USED_FOLDER_KEY, &token) {
            warn!("保存最近使用目录失败: {}", e);
        }
        state.last_used_folder = Some(save_folder.clone());

        let task = TaskHandle::new(record, Some(operation), Some(save_folder.clone()));
        state.collection.push(task.clone());
        info!(
            "已添加任务: id={}, 文件={}, 源={}",
            task.id(),
            created.name,
            source_uri
        );

        // 记录已经存在，启动失败时任务保持 Queued，可稍后恢复
        match task.start().await {
            Ok(()) => state.persist(&task),
            Err(e) => warn!("任务 {} 启动失败: {}", task.id(), e),
        }

        self.shared.emit(RegistryEvent::TaskAdded {
            task: task.snapshot(),
        });
        Ok(task)
    }

    /// 移除任务
    ///
    /// 未结束的任务先取消；未完成的任务删除目标文件（失败只记录警告）。
    /// 对已移除的任务重复调用直接返回成功。
    pub async fn remove_task(&self, task: &TaskHandle) -> Result<(), RegistryError> {
        let mut state = self.shared.state.lock().await;
        remove_locked(&self.shared, &mut state, task).await?;
        Ok(())
    }

    /// 写回任务当前状态（任务已移除时返回 false）
    ///
    /// `task` 可能是旧一轮列表中的句柄：写回的是当前集合中的同一任务，
    /// 旧句柄上的终态会先合并过去
    pub async fn save_task(&self, task: &TaskHandle) -> Result<bool, RegistryError> {
        let state = self.shared.state.lock().await;
        if !state.tasks.has(task.id())? {
            return Ok(false);
        }

        let current = state
            .collection
            .find(task.id())
            .map(|(_, t)| t.clone())
            .unwrap_or_else(|| task.clone());
        if task.is_final() {
            current.apply_status(task.status());
        }
        current.refresh_from_live();

        state.tasks.put(current.id(), current.record().to_stored())?;
        self.shared.emit(RegistryEvent::TaskUpdated {
            task: current.snapshot(),
        });
        Ok(true)
    }

    /// 暂停任务并写回，任务不存在时返回 None
    pub async fn pause_task(&self, id: &str) -> Result<Option<TaskHandle>, RegistryError> {
        self.run_command(id, TaskCommand::Pause).await
    }

    /// 恢复任务并写回，任务不存在时返回 None
    pub async fn resume_task(&self, id: &str) -> Result<Option<TaskHandle>, RegistryError> {
        self.run_command(id, TaskCommand::Resume).await
    }

    /// 取消任务并写回，任务不存在时返回 None
    pub async fn cancel_task(&self, id: &str) -> Result<Option<TaskHandle>, RegistryError> {
        self.run_command(id, TaskCommand::Cancel).await
    }

    /// 在锁内对当前集合中的句柄执行命令，并立即写回记录
    async fn run_command(
        &self,
        id: &str,
        command: TaskCommand,
    ) -> Result<Option<TaskHandle>, RegistryError> {
        let state = self.shared.state.lock().await;
        let Some(task) = state.collection.find(id).map(|(_, t)| t.clone()) else {
            return Ok(None);
        };

        task.refresh_from_live();
        match command {
            TaskCommand::Pause => task.pause().await?,
            TaskCommand::Resume => task.resume().await?,
            TaskCommand::Cancel => task.cancel().await?,
        }

        state.tasks.put(task.id(), task.record().to_stored())?;
        debug!("任务 {} 执行 {:?} 后状态: {}", task.id(), command, task.status());
        self.shared.emit(RegistryEvent::TaskUpdated {
            task: task.snapshot(),
        });
        Ok(Some(task))
    }

    /// 恢复所有任务，返回成功数量
    ///
    /// 单个任务失败只记录警告，不影响其他任务
    pub async fn start_all(&self) -> usize {
        let state = self.shared.state.lock().await;
        let mut started = 0;

        for task in state.collection.iter().filter(|t| !t.is_final()) {
            match task.resume().await {
                Ok(()) => {
                    started += 1;
                    state.persist(task);
                    self.shared.emit(RegistryEvent::TaskUpdated {
                        task: task.snapshot(),
                    });
                }
                Err(e) => warn!("恢复任务失败: {}", e),
            }
        }

        info!("全部开始: 成功 {} 个", started);
        started
    }

    /// 暂停所有任务，返回成功数量
    pub async fn pause_all(&self) -> usize {
        let state = self.shared.state.lock().await;
        let mut paused = 0;

        for task in state.collection.iter().filter(|t| !t.is_final()) {
            match task.pause().await {
                Ok(()) => {
                    paused += 1;
                    state.persist(task);
                    self.shared.emit(RegistryEvent::TaskUpdated {
                        task: task.snapshot(),
                    });
                }
                Err(e) => warn!("暂停任务失败: {}", e),
            }
        }

        info!("全部暂停: 成功 {} 个", paused);
        paused
    }

    /// 移除所有已结束的任务，返回移除数量
    pub async fn clear_finished(&self) -> usize {
        let mut state = self.shared.state.lock().await;

        for task in state.collection.iter() {
            task.refresh_from_live();
        }
        let finished: Vec<TaskHandle> = state
            .collection
            .iter()
            .filter(|t| t.is_final())
            .cloned()
            .collect();

        let mut removed = 0;
        for task in &finished {
            match remove_locked(&self.shared, &mut state, task).await {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => warn!("清除任务失败: {}, 错误: {}", task.id(), e),
            }
        }

        info!("已清除 {} 个已结束任务", removed);
        removed
    }

    /// 默认保存目录
    pub async fn default_folder(&self) -> Option<FolderHandle> {
        self.shared.state.lock().await.default_folder.clone()
    }

    /// 设置默认保存目录，`None` 清除
    pub async fn set_default_folder(
        &self,
        folder: Option<&FolderHandle>,
    ) -> Result<(), RegistryError> {
        let mut state = self.shared.state.lock().await;
        match folder {
            Some(folder) => {
                let token = self.shared.resolver.add_token(folder).await?;
                state.root.put_string(DEFAULT_FOLDER_KEY, &token)?;
                state.default_folder = Some(folder.clone());
                info!("默认保存目录已设置: {:?}", folder.path());
            }
            None => {
                state.root.remove(DEFAULT_FOLDER_KEY)?;
                state.default_folder = None;
                info!("默认保存目录已清除");
            }
        }
        Ok(())
    }

    /// 最近一次添加任务使用的目录
    pub async fn last_used_folder(&self) -> Option<FolderHandle> {
        self.shared.state.lock().await.last_used_folder.clone()
    }

    /// 总下载带宽 (bytes/s)，最近一次 UI 刷新的结果
    pub fn total_download_bandwidth(&self) -> u64 {
        self.shared.download_bandwidth.load(Ordering::SeqCst)
    }

    /// 总上传带宽，只下载不上传，恒为 0
    pub fn total_upload_bandwidth(&self) -> u64 {
        0
    }

    /// 立即执行一次刷新
    pub async fn refresh_now(&self) -> RefreshSummary {
        let mut state = self.shared.state.lock().await;
        refresh_pass(&self.shared, &mut state)
    }

    pub async fn start_ui_refresh(&self) {
        self.refresh.lock().await.start(Arc::clone(&self.shared));
    }

    /// 停止 UI 刷新，返回后不会再有刷新
    pub async fn stop_ui_refresh(&self) {
        self.refresh.lock().await.stop().await;
    }

    pub async fn is_ui_refresh_running(&self) -> bool {
        self.refresh.lock().await.is_running()
    }

    /// 关闭登记器：停止 UI 刷新并写回所有任务
    pub async fn shutdown(&self) {
        info!("正在关闭下载任务登记器...");
        self.stop_ui_refresh().await;

        let summary = self.refresh_now().await;
        info!(
            "下载任务登记器已关闭，写回 {} 个任务（失败 {} 个）",
            summary.tasks, summary.flush_failures
        );
    }
}

/// 从根命名空间恢复目录令牌；令牌失效时移除该键
async fn restore_folder(
    root: &dyn RecordNamespace,
    resolver: &dyn FolderAccessResolver,
    key: &str,
) -> Result<Option<FolderHandle>, RegistryError> {
    let Some(token) = root.get_string(key).map_err(RegistryError::Initialization)? else {
        return Ok(None);
    };

    match resolver.resolve(&token).await {
        Ok(folder) => {
            debug!("已恢复 {}: {:?}", key, folder.path());
            Ok(Some(folder))
        }
        Err(e) => {
            warn!("{} 已失效，移除: {}", key, e);
            if let Err(e) = root.remove(key) {
                warn!("移除 {} 失败: {}", key, e);
            }
            Ok(None)
        }
    }
}

async fn cancel_quietly(operation: &dyn TransferOperation) {
    if let Err(e) = operation.cancel().await {
        warn!("取消传输失败: {}, 错误: {}", operation.id(), e);
    }
}

/// 移除任务（调用方持有锁），返回是否真的移除了记录
async fn remove_locked(
    shared: &RegistryShared,
    state: &mut RegistryState,
    task: &TaskHandle,
) -> Result<bool, RegistryError> {
    let id = task.id().to_string();

    if !state.tasks.has(&id)? {
        state.collection.tombstone(&id);
        debug!("任务 {} 已不存在，跳过", id);
        return Ok(false);
    }

    // 优先使用集合中的句柄，状态更新
    let current = state
        .collection
        .find(&id)
        .map(|(_, t)| t.clone())
        .unwrap_or_else(|| task.clone());
    current.refresh_from_live();

    if !current.is_final() {
        current.cancel().await?;
    }

    if current.status() != TaskStatus::Completed {
        if let Some(path) = current.save_file_path() {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!("已删除未完成的文件: {:?}", path),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("删除文件失败: {:?}, 错误: {}", path, e),
            }
        }
    }

    state.collection.tombstone(&id);
    state.tasks.remove(&id)?;
    shared.emit(RegistryEvent::TaskRemoved {
        task_id: id.clone(),
    });
    info!("已移除任务: {}", id);
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{AccessError, AccessTokenList};
    use crate::engine::mock::MockEngine;
    use crate::engine::TransferState;
    use crate::store::{MemoryRecordStore, SqliteRecordStore, StoreError};
    use tempfile::TempDir;

    const URI: &str = "http://example.com/file.bin";

    struct Fixture {
        dir: TempDir,
        store: MemoryRecordStore,
        engine: Arc<MockEngine>,
        resolver: Arc<AccessTokenList>,
    }

    impl Fixture {
        fn new() -> Self {
            let store = MemoryRecordStore::default();
            let resolver = Arc::new(AccessTokenList::open(&store).unwrap());
            Self {
                dir: TempDir::new().unwrap(),
                store,
                engine: MockEngine::new(),
                resolver,
            }
        }

        fn folder(&self) -> FolderHandle {
            FolderHandle::new(self.dir.path())
        }

        async fn registry(&self) -> TaskRegistry {
            TaskRegistry::initialize(
                &self.store,
                self.engine.clone(),
                self.resolver.clone(),
                RegistryOptions::new(false),
            )
            .await
            .unwrap()
        }

        fn tasks(&self) -> Arc<dyn RecordNamespace> {
            self.store.open_namespace(TASKS_NAMESPACE).unwrap()
        }

        fn root(&self) -> Arc<dyn RecordNamespace> {
            self.store.open_namespace(ROOT_NAMESPACE).unwrap()
        }
    }

    struct UnavailableStore;

    impl RecordStore for UnavailableStore {
        fn open_namespace(&self, _name: &str) -> Result<Arc<dyn RecordNamespace>, StoreError> {
            Err(StoreError::Unavailable("磁盘已卸载".to_string()))
        }
    }

    #[tokio::test]
    async fn test_initialize_unavailable_store() {
        let engine = MockEngine::new();
        let store = MemoryRecordStore::default();
        let resolver = Arc::new(AccessTokenList::open(&store).unwrap());

        let result = TaskRegistry::initialize(
            &UnavailableStore,
            engine,
            resolver,
            RegistryOptions::new(false),
        )
        .await;
        assert!(matches!(result, Err(RegistryError::Initialization(_))));
    }

    #[tokio::test]
    async fn test_add_then_list_survives_restart() {
        let fx = Fixture::new();
        let registry = fx.registry().await;

        let task = registry.add_task(URI, "file.bin", &fx.folder()).await.unwrap();
        assert_eq!(task.status(), TaskStatus::Running);
        assert!(fx.dir.path().join("file.bin").exists());
        assert_eq!(registry.last_used_folder().await, Some(fx.folder()));
        drop(registry);

        let registry = fx.registry().await;
        let view = registry.list_tasks("").await.unwrap();
        assert_eq!(view.len(), 1);

        let listed = view.get(0).unwrap();
        assert_eq!(listed.id(), task.id());
        assert_eq!(listed.source_uri(), URI);
        assert_eq!(listed.file_name(), "file.bin");
        assert_eq!(listed.status(), TaskStatus::Running);
        assert!(listed.has_live_transfer());
        assert_eq!(registry.last_used_folder().await, Some(fx.folder()));
    }

    #[tokio::test]
    async fn test_duplicate_names_are_numbered() {
        let fx = Fixture::new();
        let registry = fx.registry().await;
        let folder = fx.folder();

        let first = registry.add_task(URI, "file.bin", &folder).await.unwrap();
        let second = registry.add_task(URI, "file.bin", &folder).await.unwrap();

        assert_eq!(first.file_name(), "file.bin");
        assert_eq!(second.file_name(), "file(1).bin");
        assert_ne!(first.id(), second.id());
    }

    #[tokio::test]
    async fn test_concurrent_adds_get_distinct_files() {
        let fx = Fixture::new();
        let registry = fx.registry().await;
        let folder = fx.folder();

        let (a, b, c) = tokio::join!(
            registry.add_task(URI, "same.bin", &folder),
            registry.add_task(URI, "same.bin", &folder),
            registry.add_task(URI, "same.bin", &folder),
        );

        let mut names = vec![
            a.unwrap().file_name(),
            b.unwrap().file_name(),
            c.unwrap().file_name(),
        ];
        names.sort();
        assert_eq!(names, vec!["same(1).bin", "same(2).bin", "same.bin"]);
        assert_eq!(fx.tasks().enumerate().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_failed_add_leaves_no_trace() {
        let fx = Fixture::new();
        let registry = fx.registry().await;
        fx.engine.set_fail_submit(true);

        let result = registry.add_task(URI, "file.bin", &fx.folder()).await;
        assert!(matches!(result, Err(RegistryError::Creation(_))));

        assert!(!fx.dir.path().join("file.bin").exists());
        assert!(fx.tasks().enumerate().unwrap().is_empty());
        assert!(!fx.root().has(LAST_USED_FOLDER_KEY).unwrap());
        assert!(registry.list_tasks("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_add_into_missing_folder() {
        let fx = Fixture::new();
        let registry = fx.registry().await;
        let missing = FolderHandle::new(fx.dir.path().join("gone"));

        let result = registry.add_task(URI, "file.bin", &missing).await;
        assert!(matches!(result, Err(RegistryError::Creation(_))));
        assert_eq!(fx.engine.submitted.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent_and_deletes_partial_file() {
        let fx = Fixture::new();
        let registry = fx.registry().await;
        let task = registry.add_task(URI, "file.bin", &fx.folder()).await.unwrap();
        let path = fx.dir.path().join("file.bin");
        assert!(path.exists());

        registry.remove_task(&task).await.unwrap();
        assert!(!path.exists());
        assert_eq!(fx.engine.live_count(), 0);
        assert!(fx.tasks().enumerate().unwrap().is_empty());
        assert!(registry.find_task(task.id()).await.is_none());

        // 再次移除同一句柄：成功且无副作用
        registry.remove_task(&task).await.unwrap();
        assert!(registry.list_tasks("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_completed_keeps_file() {
        let fx = Fixture::new();
        let registry = fx.registry().await;
        let task = registry.add_task(URI, "done.bin", &fx.folder()).await.unwrap();
        fx.engine
            .get(&task.engine_handle_id())
            .unwrap()
            .set_state(TransferState::Completed);

        registry.remove_task(&task).await.unwrap();
        assert!(fx.dir.path().join("done.bin").exists());
        assert!(fx.tasks().enumerate().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_after_engine_restart() {
        let fx = Fixture::new();
        let registry = fx.registry().await;
        registry.add_task(URI, "file.bin", &fx.folder()).await.unwrap();
        fx.engine.forget_all();

        let view = registry.list_tasks("").await.unwrap();
        assert_eq!(view.len(), 1);
        let task = view.get(0).unwrap().clone();
        assert!(!task.has_live_transfer());
        assert_eq!(task.bytes_received_speed(), 0);

        // 没有存活传输也能移除
        registry.remove_task(&task).await.unwrap();
        assert!(registry.list_tasks("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_filter() {
        let fx = Fixture::new();
        let registry = fx.registry().await;
        let folder = fx.folder();
        registry.add_task(URI, "Report.pdf", &folder).await.unwrap();
        registry.add_task(URI, "movie.mkv", &folder).await.unwrap();

        assert_eq!(registry.list_tasks("").await.unwrap().len(), 2);
        let view = registry.list_tasks("REPORT").await.unwrap();
        assert_eq!(view.len(), 1);
        assert_eq!(view.get(0).unwrap().file_name(), "Report.pdf");
        assert!(registry.list_tasks("zip").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bulk_commands_continue_past_failures() {
        let fx = Fixture::new();
        let registry = fx.registry().await;
        let folder = fx.folder();

        let mut tasks = Vec::new();
        for name in ["a.bin", "b.bin", "c.bin"] {
            tasks.push(registry.add_task(URI, name, &folder).await.unwrap());
        }
        fx.engine
            .get(&tasks[1].engine_handle_id())
            .unwrap()
            .set_fail_pause(true);

        assert_eq!(registry.pause_all().await, 2);
        assert_eq!(tasks[0].status(), TaskStatus::Paused);
        assert_eq!(tasks[1].status(), TaskStatus::Running);
        assert_eq!(tasks[2].status(), TaskStatus::Paused);

        fx.engine
            .get(&tasks[0].engine_handle_id())
            .unwrap()
            .set_fail_resume(true);
        assert_eq!(registry.start_all().await, 2);
        assert_eq!(tasks[0].status(), TaskStatus::Paused);
        assert_eq!(tasks[2].status(), TaskStatus::Running);
        for task in &tasks[1..] {
            let op = fx.engine.get(&task.engine_handle_id()).unwrap();
            assert_eq!(op.resume_calls.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn test_clear_finished() {
        let fx = Fixture::new();
        let registry = fx.registry().await;
        let folder = fx.folder();

        let done = registry.add_task(URI, "done.bin", &folder).await.unwrap();
        let running = registry.add_task(URI, "running.bin", &folder).await.unwrap();
        fx.engine
            .get(&done.engine_handle_id())
            .unwrap()
            .set_state(TransferState::Completed);

        assert_eq!(registry.clear_finished().await, 1);

        let view = registry.list_tasks("").await.unwrap();
        assert_eq!(view.len(), 1);
        assert_eq!(view.get(0).unwrap().id(), running.id());
        assert!(fx.dir.path().join("done.bin").exists());
    }

    #[tokio::test]
    async fn test_stale_last_used_folder_is_dropped() {
        let fx = Fixture::new();
        fx.root().put_string(LAST_USED_FOLDER_KEY, "stale-token").unwrap();

        let registry = fx.registry().await;
        assert_eq!(registry.last_used_folder().await, None);
        assert!(!fx.root().has(LAST_USED_FOLDER_KEY).unwrap());
    }

    #[tokio::test]
    async fn test_default_folder_persists() {
        let fx = Fixture::new();
        let registry = fx.registry().await;
        assert_eq!(registry.default_folder().await, None);

        registry
            .set_default_folder(Some(&fx.folder()))
            .await
            .unwrap();
        drop(registry);

        let registry = fx.registry().await;
        assert_eq!(registry.default_folder().await, Some(fx.folder()));

        registry.set_default_folder(None).await.unwrap();
        assert!(!fx.root().has(DEFAULT_FOLDER_KEY).unwrap());
    }

    #[tokio::test]
    async fn test_refresh_flushes_and_sums_bandwidth() {
        let fx = Fixture::new();
        let registry = TaskRegistry::initialize(
            &fx.store,
            fx.engine.clone(),
            fx.resolver.clone(),
            RegistryOptions {
                enable_ui_refresh: true,
                refresh_interval: Duration::from_millis(20),
            },
        )
        .await
        .unwrap();
        assert!(registry.is_ui_refresh_running().await);

        let folder = fx.folder();
        let a = registry.add_task(URI, "a.bin", &folder).await.unwrap();
        let b = registry.add_task(URI, "b.bin", &folder).await.unwrap();
        fx.engine.get(&a.engine_handle_id()).unwrap().set_speed(300);
        fx.engine.get(&b.engine_handle_id()).unwrap().set_speed(200);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while registry.total_download_bandwidth() != 500 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(registry.total_download_bandwidth(), 500);
        assert_eq!(registry.total_upload_bandwidth(), 0);

        registry.stop_ui_refresh().await;
        assert!(!registry.is_ui_refresh_running().await);

        // 停止后引擎状态变化不再写回
        fx.engine
            .get(&a.engine_handle_id())
            .unwrap()
            .set_state(TransferState::Completed);
        tokio::time::sleep(Duration::from_millis(80)).await;
        let stored = TaskRecord::from_stored(a.id(), &fx.tasks().get(a.id()).unwrap().unwrap())
            .unwrap();
        assert_eq!(stored.status(), TaskStatus::Running);

        // 关闭时写回最终状态
        registry.shutdown().await;
        let stored = TaskRecord::from_stored(a.id(), &fx.tasks().get(a.id()).unwrap().unwrap())
            .unwrap();
        assert_eq!(stored.status(), TaskStatus::Completed);
    }

    fn stored_status(fx: &Fixture, id: &str) -> TaskStatus {
        let value = fx.tasks().get(id).unwrap().unwrap();
        TaskRecord::from_stored(id, &value).unwrap().status()
    }

    #[tokio::test]
    async fn test_cancel_survives_interleaved_list_and_tick() {
        let fx = Fixture::new();
        let registry = fx.registry().await;
        let added = registry.add_task(URI, "file.bin", &fx.folder()).await.unwrap();

        // 旧句柄上的命令，中间穿插一次列表重建
        let task = registry.find_task(added.id()).await.unwrap();
        task.cancel().await.unwrap();
        let listed = registry.list_tasks("").await.unwrap();
        assert!(!listed.find(task.id()).unwrap().has_live_transfer());

        assert!(registry.save_task(&task).await.unwrap());
        registry.refresh_now().await;

        assert_eq!(stored_status(&fx, task.id()), TaskStatus::Canceled);
        let listed = registry.list_tasks("").await.unwrap();
        assert_eq!(listed.find(task.id()).unwrap().status(), TaskStatus::Canceled);
    }

    #[tokio::test]
    async fn test_task_commands_persist_under_lock() {
        let fx = Fixture::new();
        let registry = fx.registry().await;
        let task = registry.add_task(URI, "file.bin", &fx.folder()).await.unwrap();
        let id = task.id().to_string();

        let paused = registry.pause_task(&id).await.unwrap().unwrap();
        assert_eq!(paused.status(), TaskStatus::Paused);
        assert_eq!(stored_status(&fx, &id), TaskStatus::Paused);

        registry.resume_task(&id).await.unwrap().unwrap();
        assert_eq!(stored_status(&fx, &id), TaskStatus::Running);

        let (canceled, listed) = tokio::join!(registry.cancel_task(&id), registry.list_tasks(""));
        assert_eq!(canceled.unwrap().unwrap().status(), TaskStatus::Canceled);
        listed.unwrap();
        registry.refresh_now().await;

        assert_eq!(stored_status(&fx, &id), TaskStatus::Canceled);
        let view = registry.list_tasks("").await.unwrap();
        assert_eq!(view.find(&id).unwrap().status(), TaskStatus::Canceled);

        // 终态之后恢复是空操作，不会回到 Running
        registry.resume_task(&id).await.unwrap().unwrap();
        assert_eq!(stored_status(&fx, &id), TaskStatus::Canceled);

        assert!(registry.pause_task("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_command_reports_task_error() {
        let fx = Fixture::new();
        let registry = fx.registry().await;
        let task = registry.add_task(URI, "file.bin", &fx.folder()).await.unwrap();
        fx.engine
            .get(&task.engine_handle_id())
            .unwrap()
            .set_fail_pause(true);

        let result = registry.pause_task(task.id()).await;
        assert!(matches!(result, Err(RegistryError::Task(_))));
        assert_eq!(stored_status(&fx, task.id()), TaskStatus::Running);
    }

    #[tokio::test]
    async fn test_list_reports_live_completion_without_persisting() {
        let fx = Fixture::new();
        let registry = fx.registry().await;
        let task = registry.add_task(URI, "file.bin", &fx.folder()).await.unwrap();
        fx.engine
            .get(&task.engine_handle_id())
            .unwrap()
            .set_state(TransferState::Completed);

        let view = registry.list_tasks("").await.unwrap();
        let listed = view.find(task.id()).unwrap();
        assert_eq!(listed.status(), TaskStatus::Completed);
        assert!(listed.is_final());
        assert_eq!(stored_status(&fx, task.id()), TaskStatus::Running);

        registry.refresh_now().await;
        assert_eq!(stored_status(&fx, task.id()), TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_list_does_not_cause_spurious_updates() {
        let fx = Fixture::new();
        let registry = fx.registry().await;
        let task = registry.add_task(URI, "file.bin", &fx.folder()).await.unwrap();

        registry.refresh_now().await;
        assert_eq!(registry.refresh_now().await.changed, 0);

        registry.list_tasks("").await.unwrap();
        assert_eq!(registry.refresh_now().await.changed, 0);
        assert_eq!(
            registry.task_snapshot(task.id()).await.unwrap().status,
            TaskStatus::Running
        );
        assert!(registry.task_snapshot("missing").await.is_none());

        // 列表之间发生的真实变化仍然会通知
        fx.engine
            .get(&task.engine_handle_id())
            .unwrap()
            .set_state(TransferState::Completed);
        registry.list_tasks("").await.unwrap();
        let mut rx = registry.subscribe();
        assert_eq!(registry.refresh_now().await.changed, 1);
        match rx.recv().await.unwrap() {
            RegistryEvent::TaskUpdated { task: snapshot } => {
                assert_eq!(snapshot.status, TaskStatus::Completed)
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    struct StalledResolver;

    #[async_trait::async_trait]
    impl FolderAccessResolver for StalledResolver {
        async fn add_token(&self, _folder: &FolderHandle) -> Result<String, AccessError> {
            std::future::pending().await
        }

        async fn resolve(&self, token: &str) -> Result<FolderHandle, AccessError> {
            Err(AccessError::UnknownToken(token.to_string()))
        }
    }

    #[tokio::test]
    async fn test_dropped_add_cancels_submitted_transfer() {
        let fx = Fixture::new();
        let registry = TaskRegistry::initialize(
            &fx.store,
            fx.engine.clone(),
            Arc::new(StalledResolver),
            RegistryOptions::new(false),
        )
        .await
        .unwrap();

        let result = tokio::time::timeout(
            Duration::from_millis(50),
            registry.add_task(URI, "file.bin", &fx.folder()),
        )
        .await;
        assert!(result.is_err());
        assert_eq!(fx.engine.submitted.load(Ordering::SeqCst), 1);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while fx.engine.live_count() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(fx.engine.live_count(), 0);
        assert!(!fx.dir.path().join("file.bin").exists());
        assert!(fx.tasks().enumerate().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_events() {
        let fx = Fixture::new();
        let registry = fx.registry().await;
        let mut rx = registry.subscribe();

        let task = registry.add_task(URI, "file.bin", &fx.folder()).await.unwrap();
        match rx.recv().await.unwrap() {
            RegistryEvent::TaskAdded { task: snapshot } => assert_eq!(snapshot.id, task.id()),
            other => panic!("unexpected event: {:?}", other),
        }

        registry.remove_task(&task).await.unwrap();
        match rx.recv().await.unwrap() {
            RegistryEvent::TaskRemoved { task_id } => assert_eq!(task_id, task.id()),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_sqlite_round_trip() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("registry.db");
        let downloads = dir.path().join("downloads");
        std::fs::create_dir_all(&downloads).unwrap();
        let folder = FolderHandle::new(&downloads);
        let engine = MockEngine::new();

        let id = {
            let store = SqliteRecordStore::open(&db_path).unwrap();
            let resolver = Arc::new(AccessTokenList::open(&store).unwrap());
            let registry = TaskRegistry::initialize(
                &store,
                engine.clone(),
                resolver,
                RegistryOptions::new(false),
            )
            .await
            .unwrap();
            let task = registry.add_task(URI, "file.bin", &folder).await.unwrap();
            registry.shutdown().await;
            task.id().to_string()
        };

        let store = SqliteRecordStore::open(&db_path).unwrap();
        let resolver = Arc::new(AccessTokenList::open(&store).unwrap());
        let registry =
            TaskRegistry::initialize(&store, engine, resolver, RegistryOptions::new(false))
                .await
                .unwrap();

        let view = registry.list_tasks("").await.unwrap();
        assert_eq!(view.len(), 1);
        let task = view.find(&id).unwrap();
        assert_eq!(task.folder(), Some(&folder));
        assert_eq!(registry.last_used_folder().await, Some(folder));
    }
}
