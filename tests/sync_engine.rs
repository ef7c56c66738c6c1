//! 同步引擎端到端测试：内存数据源 + 内存 / 本地目录归档目标

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use campaign_archiver::config::{StorageConfig, SyncSettings};
use campaign_archiver::core::MARKER_NAME;
use campaign_archiver::source::MemorySource;
use campaign_archiver::storage::{FileMeta, LocalStorage, Storage};
use campaign_archiver::target::{create_target, MemoryTarget, Properties, StorageTarget};
use campaign_archiver::{
    ArchiveError, CandidateItem, ItemPayload, SourceSystem, SyncCoordinator, TargetSystem,
};
use chrono::{DateTime, Duration, TimeZone, Utc};

fn settings() -> SyncSettings {
    let mut settings = SyncSettings {
        item_delay_ms: 0,
        ..Default::default()
    };
    settings.retry.initial_delay_ms = 1;
    settings.retry.max_delay_ms = 5;
    settings
}

fn email(id: i64, name: &str, group: Option<&str>, updated_at: DateTime<Utc>) -> CandidateItem {
    CandidateItem {
        id,
        display_name: name.to_string(),
        created_at: Utc.with_ymd_and_hms(2024, 1, 10, 9, 0, 0).unwrap(),
        updated_at,
        group_label: group.map(String::from),
    }
}

fn html(body: &str) -> Option<ItemPayload> {
    Some(ItemPayload {
        html_body: Some(body.to_string()),
        subject: Some("Subject".into()),
        sender_name: Some("Team".into()),
        sender_address: Some("team@example.com".into()),
    })
}

async fn seeded_source(count: i64) -> Arc<MemorySource> {
    let source = Arc::new(MemorySource::new());
    let recent = Utc::now() - Duration::days(1);
    for id in 1..=count {
        source
            .upsert(
                email(id, &format!("Email {}", id), Some("Spring"), recent),
                html(&format!("<p>{}</p>", id)),
            )
            .await;
    }
    source
}

#[tokio::test]
async fn second_run_is_idempotent() {
    let source = seeded_source(3).await;
    let target = Arc::new(MemoryTarget::new());
    let coordinator = SyncCoordinator::new(source.clone(), target.clone(), &settings());

    let first = coordinator.run_sync().await.unwrap();
    assert_eq!(first.total_candidates, 3);
    assert_eq!(first.succeeded, 3);
    assert_eq!(first.failed, 0);
    // 3 x (HTML + 元数据) + 水位标记
    assert_eq!(target.create_count().await, 7);

    // 水位被清掉后重新跑，所有条目都已存在
    let second = SyncCoordinator::new(source, Arc::new(ForgetfulTarget(target.clone())), &settings())
        .run_sync()
        .await
        .unwrap();
    assert_eq!(second.total_candidates, 3);
    assert_eq!(second.succeeded, 0);
    assert_eq!(second.skipped, 3);
    assert_eq!(second.failed, 0);
    assert_eq!(second.processed(), 3);
    assert_eq!(target.create_count().await, 7);
}

#[tokio::test]
async fn watermark_is_start_instant_and_catches_mid_run_updates() {
    let source = seeded_source(2).await;
    let target = Arc::new(MemoryTarget::new());
    let coordinator = SyncCoordinator::new(source.clone(), target.clone(), &settings());

    let first = coordinator.run_sync().await.unwrap();
    assert!(first.watermark_saved);
    assert_eq!(
        coordinator.load_state().await.last_sync_timestamp,
        Some(first.started_at)
    );
    assert!(first.started_at <= first.finished_at);

    // 运行结束后源端更新了一个新条目
    source
        .upsert(
            email(9, "Late", None, first.started_at + Duration::milliseconds(1)),
            html("<p>late</p>"),
        )
        .await;

    let second = coordinator.run_sync().await.unwrap();
    assert_eq!(second.since, first.started_at);
    assert_eq!(second.total_candidates, 1);
    assert_eq!(second.succeeded, 1);
    assert!(target
        .node_ids()
        .await
        .contains(&"2024/01/Uncategorized/9-Late.html".to_string()));
}

#[tokio::test]
async fn failed_items_are_contained_and_reported() {
    let source = seeded_source(4).await;
    let recent = Utc::now() - Duration::hours(2);
    source.upsert(email(2, "Email 2", None, recent), None).await;
    source
        .upsert(email(4, "Email 4", None, recent), html("   "))
        .await;
    let target = Arc::new(MemoryTarget::new());

    let result = SyncCoordinator::new(source, target.clone(), &settings())
        .run_sync()
        .await
        .unwrap();

    assert_eq!(result.total_candidates, 4);
    assert_eq!(result.succeeded, 2);
    assert_eq!(result.failed, 2);
    assert_eq!(result.failed_ids.iter().copied().collect::<Vec<_>>(), vec![2, 4]);
    assert_eq!(
        result.total_candidates,
        result.succeeded + result.failed + result.skipped
    );
    // 部分失败时水位仍然前进
    assert!(result.watermark_saved);
}

#[tokio::test]
async fn transient_target_errors_are_retried() {
    let source = seeded_source(2).await;
    let inner = Arc::new(MemoryTarget::new());
    let flaky = Arc::new(FlakyTarget::new(inner.clone(), 2));

    let result = SyncCoordinator::new(source, flaky.clone(), &settings())
        .run_sync()
        .await
        .unwrap();

    assert_eq!(result.succeeded, 2);
    assert_eq!(result.failed, 0);
    assert_eq!(flaky.injected.load(Ordering::SeqCst), 2);
    assert_eq!(inner.create_count().await, 5);
}

#[tokio::test]
async fn listing_failure_is_fatal_and_keeps_watermark() {
    let target = Arc::new(MemoryTarget::new());
    let err = SyncCoordinator::new(Arc::new(DownSource), target.clone(), &settings())
        .run_sync()
        .await
        .unwrap_err();

    assert!(matches!(
        err.downcast_ref::<ArchiveError>(),
        Some(ArchiveError::Remote {
            status: Some(503),
            ..
        })
    ));
    assert!(target.node_ids().await.is_empty());
}

#[tokio::test]
async fn nothing_to_do_leaves_watermark_untouched() {
    let source = Arc::new(MemorySource::new());
    source
        .upsert(
            email(1, "Old", None, Utc::now() - Duration::days(400)),
            html("<p>old</p>"),
        )
        .await;
    let target = Arc::new(MemoryTarget::new());

    let result = SyncCoordinator::new(source, target.clone(), &settings())
        .run_sync()
        .await
        .unwrap();

    assert_eq!(result.total_candidates, 0);
    assert!(!result.watermark_saved);
    assert_eq!(target.create_count().await, 0);
}

#[tokio::test]
async fn archives_into_local_directory() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(MemorySource::new());
    source
        .upsert(
            email(
                42,
                "Test/Campaign:2024",
                Some("Q1: Launch"),
                Utc::now() - Duration::days(1),
            ),
            html("<html>hi</html>"),
        )
        .await;

    let target = create_target(&StorageConfig::local(dir.path().to_str().unwrap()))
        .await
        .unwrap();
    let coordinator = SyncCoordinator::new(source, target, &settings());
    let result = coordinator.run_sync().await.unwrap();
    assert_eq!(result.succeeded, 1);

    let folder = dir.path().join("2024").join("01").join("Q1- Launch");
    assert_eq!(
        std::fs::read_to_string(folder.join("42-Test-Campaign-2024.html")).unwrap(),
        "<html>hi</html>"
    );
    assert!(folder.join("42-Test-Campaign-2024-metadata.json").is_file());
    assert!(dir.path().join(MARKER_NAME).is_file());

    let again = coordinator.run_sync().await.unwrap();
    assert_eq!(again.total_candidates, 0);
}

#[tokio::test]
async fn transient_property_write_does_not_lose_properties() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(MemorySource::new());
    source
        .upsert(
            email(1, "A", None, Utc::now() - Duration::days(1)),
            html("<p>a</p>"),
        )
        .await;

    let storage = Arc::new(StutteringStorage {
        inner: LocalStorage::new(dir.path().to_str().unwrap()).unwrap(),
        failures_left: AtomicU32::new(1),
    });
    let target = Arc::new(StorageTarget::new(storage.clone()));

    let result = SyncCoordinator::new(source, target.clone(), &settings())
        .run_sync()
        .await
        .unwrap();
    assert_eq!(result.succeeded, 1);
    assert_eq!(result.failed, 0);
    assert_eq!(storage.failures_left.load(Ordering::SeqCst), 0);

    let node = "2024/01/Uncategorized/1-A.html";
    let props = target.get_properties(node).await.unwrap();
    assert_eq!(props.get("archive:emailId"), Some(&serde_json::json!(1)));
    assert!(dir
        .path()
        .join("2024/01/Uncategorized/1-A-metadata.json")
        .is_file());
}

/// 前 N 次写 HTML 属性文件时超时的存储
struct StutteringStorage {
    inner: LocalStorage,
    failures_left: AtomicU32,
}

#[async_trait]
impl Storage for StutteringStorage {
    async fn stat(&self, path: &str) -> Result<Option<FileMeta>> {
        self.inner.stat(path).await
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        self.inner.read(path).await
    }

    async fn write(&self, path: &str, data: Vec<u8>) -> Result<()> {
        if path.ends_with(".html.properties.json") {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                let err = std::io::Error::new(std::io::ErrorKind::TimedOut, "write timed out");
                return Err(err.into());
            }
        }
        self.inner.write(path, data).await
    }

    async fn create_dir(&self, path: &str) -> Result<()> {
        self.inner.create_dir(path).await
    }

    fn name(&self) -> &str {
        "stuttering"
    }
}

/// 隐藏水位标记的目标，模拟水位丢失
struct ForgetfulTarget(Arc<MemoryTarget>);

#[async_trait]
impl TargetSystem for ForgetfulTarget {
    async fn ensure_container_path(&self, segments: &[String]) -> Result<String> {
        self.0.ensure_container_path(segments).await
    }

    async fn find_child_by_name(&self, container_id: &str, name: &str) -> Result<Option<String>> {
        if name == MARKER_NAME {
            return Ok(None);
        }
        self.0.find_child_by_name(container_id, name).await
    }

    async fn create_child(
        &self,
        container_id: &str,
        name: &str,
        content: Vec<u8>,
        properties: Properties,
    ) -> Result<String> {
        self.0
            .create_child(container_id, name, content, properties)
            .await
    }

    async fn set_properties(&self, node_id: &str, properties: Properties) -> Result<()> {
        self.0.set_properties(node_id, properties).await
    }

    async fn get_properties(&self, node_id: &str) -> Result<Properties> {
        self.0.get_properties(node_id).await
    }

    fn name(&self) -> &str {
        "forgetful"
    }
}

/// 前 N 次创建返回 503 的目标
struct FlakyTarget {
    inner: Arc<MemoryTarget>,
    failures: u32,
    injected: AtomicU32,
}

impl FlakyTarget {
    fn new(inner: Arc<MemoryTarget>, failures: u32) -> Self {
        Self {
            inner,
            failures,
            injected: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl TargetSystem for FlakyTarget {
    async fn ensure_container_path(&self, segments: &[String]) -> Result<String> {
        self.inner.ensure_container_path(segments).await
    }

    async fn find_child_by_name(&self, container_id: &str, name: &str) -> Result<Option<String>> {
        self.inner.find_child_by_name(container_id, name).await
    }

    async fn create_child(
        &self,
        container_id: &str,
        name: &str,
        content: Vec<u8>,
        properties: Properties,
    ) -> Result<String> {
        let injected = self.injected.load(Ordering::SeqCst);
        if injected < self.failures {
            self.injected.store(injected + 1, Ordering::SeqCst);
            return Err(ArchiveError::remote(Some(503), "repository busy").into());
        }
        self.inner
            .create_child(container_id, name, content, properties)
            .await
    }

    async fn set_properties(&self, node_id: &str, properties: Properties) -> Result<()> {
        self.inner.set_properties(node_id, properties).await
    }

    async fn get_properties(&self, node_id: &str) -> Result<Properties> {
        self.inner.get_properties(node_id).await
    }

    fn name(&self) -> &str {
        "flaky"
    }
}

/// 列表接口始终不可用的数据源
struct DownSource;

#[async_trait]
impl SourceSystem for DownSource {
    async fn list_changed_since(&self, _since: DateTime<Utc>) -> Result<Vec<CandidateItem>> {
        Err(ArchiveError::remote(Some(503), "maintenance").into())
    }

    async fn fetch_payload(&self, _id: i64) -> Result<Option<ItemPayload>> {
        Ok(None)
    }

    fn name(&self) -> &str {
        "down"
    }
}
