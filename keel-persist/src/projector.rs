//! Outbox 投影器（OutboxProjector）
//!
//! 长驻任务：周期性从 Outbox 领取待发行并发布到消息总线，
//! 按行标记成功或失败（失败行回到待发，超限进死信）。另有一个
//! 在途回收任务把超过领取时限仍处 Publishing 的行放回待发，
//! 覆盖投递实例在领取与标记之间崩溃的场景；可选地携带一个
//! 收件箱保留期清理任务。提供关闭与等待的 [`ProjectorHandle`]。

use crate::bus::MessageBus;
use crate::inbox::InboxStore;
use crate::outbox::OutboxStore;
use bon::Builder;
use chrono::Utc;
use keel_domain::error::DomainResult;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// 投影器配置
#[derive(Clone, Debug)]
pub struct ProjectorConfig {
    /// Outbox -> Bus 的轮询间隔
    pub poll_interval: Duration,
    /// 单次领取的最大行数
    pub batch_size: usize,
    /// 仅投递指定租户的行（None 表示不过滤）
    pub tenant_id: Option<String>,
    /// 在途回收的运行间隔
    pub reclaim_interval: Duration,
    /// Publishing 行超过该时限未落标记即视为在途滞留，放回待发
    pub claim_timeout: Duration,
    /// 收件箱清理的运行间隔
    pub retention_interval: Duration,
    /// 收件箱记录的保留时长
    pub retention_age: Duration,
}

impl Default for ProjectorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            batch_size: 100,
            tenant_id: None,
            reclaim_interval: Duration::from_secs(30),
            claim_timeout: Duration::from_secs(60),
            retention_interval: Duration::from_secs(60 * 60),
            retention_age: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

/// Outbox 投影器
#[derive(Builder)]
pub struct OutboxProjector {
    outbox: Arc<dyn OutboxStore>,
    bus: Arc<dyn MessageBus>,
    /// 提供收件箱即启用保留期清理任务
    inbox: Option<Arc<dyn InboxStore>>,
    #[builder(default)]
    config: ProjectorConfig,
}

impl OutboxProjector {
    /// 启动投影器，返回可用于关闭/等待的句柄
    pub fn start(self: Arc<Self>) -> ProjectorHandle {
        let token = CancellationToken::new();
        let mut tasks: Vec<JoinHandle<()>> = Vec::with_capacity(3);

        // deliver worker（周期任务）
        {
            let projector = self.clone();
            let interval = self.config.poll_interval;
            tasks.push(Self::spawn_periodic(token.clone(), interval, move || {
                let projector = projector.clone();
                async move {
                    if let Err(e) = projector.drain_once().await {
                        tracing::error!(error = %e, "Outbox 投递轮次失败");
                    }
                }
            }));
        }

        // reclaim worker（周期任务）：投递实例在领取与标记之间崩溃时，
        // Publishing 行会滞留在途，按领取时限放回待发
        {
            let outbox = self.outbox.clone();
            let timeout = self.config.claim_timeout;
            let interval = self.config.reclaim_interval;
            tasks.push(Self::spawn_periodic(token.clone(), interval, move || {
                let outbox = outbox.clone();
                async move {
                    let cutoff = Utc::now()
                        - chrono::Duration::from_std(timeout)
                            .unwrap_or(chrono::Duration::seconds(60));
                    match outbox.requeue_stale(cutoff).await {
                        Ok(requeued) if requeued > 0 => {
                            tracing::warn!(requeued, "在途滞留的 Outbox 行已放回待发");
                        }
                        Ok(_) => {}
                        Err(e) => tracing::warn!(error = %e, "在途回收失败"),
                    }
                }
            }));
        }

        // retention worker（周期任务，可选）
        if let Some(inbox) = self.inbox.clone() {
            let age = self.config.retention_age;
            let interval = self.config.retention_interval;
            tasks.push(Self::spawn_periodic(token.clone(), interval, move || {
                let inbox = inbox.clone();
                async move {
                    let cutoff = Utc::now()
                        - chrono::Duration::from_std(age).unwrap_or(chrono::Duration::days(7));
                    match inbox.cleanup_old_records(cutoff).await {
                        Ok(removed) if removed > 0 => {
                            tracing::info!(removed, "收件箱保留期清理完成");
                        }
                        Ok(_) => {}
                        Err(e) => tracing::warn!(error = %e, "收件箱保留期清理失败"),
                    }
                }
            }));
        }

        ProjectorHandle { token, tasks }
    }

    fn spawn_periodic<F, Fut>(
        token: CancellationToken,
        interval: Duration,
        mut f: F,
    ) -> JoinHandle<()>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => f().await,
                }
            }
        })
    }

    /// 领取并投递一批：逐行顺序发布（保持聚合内顺序），
    /// 返回成功投递的行数
    pub async fn drain_once(&self) -> DomainResult<usize> {
        let batch = self
            .outbox
            .pull_batch(self.config.batch_size, self.config.tenant_id.as_deref())
            .await?;
        if batch.is_empty() {
            return Ok(0);
        }

        // 单行的标记失败不中止批次：该行滞留 Publishing，由在途回收放回
        let mut sent = 0;
        for record in &batch {
            match self.bus.publish(record).await {
                Ok(()) => {
                    sent += 1;
                    if let Err(e) = self.outbox.mark_published(record.record_id()).await {
                        tracing::warn!(
                            record_id = record.record_id(),
                            error = %e,
                            "投递成功但 Sent 标记未落库，留待在途回收"
                        );
                    }
                }
                Err(e) => {
                    let reason = e.to_string();
                    tracing::warn!(
                        record_id = record.record_id(),
                        topic = record.topic(),
                        error = %reason,
                        "Outbox 行投递失败"
                    );
                    if let Err(mark_err) =
                        self.outbox.mark_failed(record.record_id(), &reason).await
                    {
                        tracing::warn!(
                            record_id = record.record_id(),
                            error = %mark_err,
                            "失败标记未落库，留待在途回收"
                        );
                    }
                }
            }
        }
        Ok(sent)
    }
}

/// 投影器运行句柄：用于优雅关闭与等待任务结束
pub struct ProjectorHandle {
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl ProjectorHandle {
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub async fn join(mut self) {
        let tasks = std::mem::take(&mut self.tasks);
        for t in tasks {
            let _ = t.await;
        }
    }
}

impl Drop for ProjectorHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::{InMemoryOutboxStore, OutboxRecord, OutboxStatus};
    use crate::storage::InMemoryDatabase;
    use async_trait::async_trait;
    use chrono::DateTime;
    use keel_domain::error::DomainError;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct RecordingBus {
        published: Mutex<Vec<String>>,
        fail_topics: Vec<&'static str>,
    }

    impl RecordingBus {
        fn new(fail_topics: Vec<&'static str>) -> Self {
            Self {
                published: Mutex::new(Vec::new()),
                fail_topics,
            }
        }
    }

    #[async_trait]
    impl MessageBus for RecordingBus {
        async fn publish(&self, record: &OutboxRecord) -> DomainResult<()> {
            if self.fail_topics.contains(&record.topic()) {
                return Err(DomainError::MessageBus {
                    reason: "目标不可达".into(),
                });
            }
            self.published
                .lock()
                .unwrap()
                .push(record.topic().to_string());
            Ok(())
        }
    }

    fn record(topic: &str) -> OutboxRecord {
        OutboxRecord::builder()
            .topic(topic.into())
            .aggregate_type("order".into())
            .aggregate_id("o-1".into())
            .aggregate_version(1)
            .payload(json!({}))
            .build()
    }

    #[tokio::test]
    async fn drain_once_publishes_in_order_and_marks_sent() {
        let db = InMemoryDatabase::new();
        let outbox = Arc::new(InMemoryOutboxStore::new(db.clone()));
        for topic in ["a", "b", "c"] {
            outbox.add(record(topic)).await.unwrap();
        }
        let bus = Arc::new(RecordingBus::new(vec![]));

        let projector = OutboxProjector::builder()
            .outbox(outbox.clone() as Arc<dyn OutboxStore>)
            .bus(bus.clone() as Arc<dyn MessageBus>)
            .build();

        let sent = projector.drain_once().await.unwrap();
        assert_eq!(sent, 3);
        assert_eq!(*bus.published.lock().unwrap(), vec!["a", "b", "c"]);
        assert_eq!(
            outbox.find_by_status(OutboxStatus::Sent, 10).await.unwrap().len(),
            3
        );
    }

    #[tokio::test]
    async fn failed_rows_go_back_to_new_and_are_retried() {
        let db = InMemoryDatabase::new();
        let outbox = Arc::new(InMemoryOutboxStore::new(db.clone()));
        outbox.add(record("bad")).await.unwrap();
        outbox.add(record("ok")).await.unwrap();
        let bus = Arc::new(RecordingBus::new(vec!["bad"]));

        let projector = OutboxProjector::builder()
            .outbox(outbox.clone() as Arc<dyn OutboxStore>)
            .bus(bus.clone() as Arc<dyn MessageBus>)
            .build();

        let sent = projector.drain_once().await.unwrap();
        assert_eq!(sent, 1);
        // 失败行回到待发，下一轮还能领到
        let retry = outbox.pull_batch(10, None).await.unwrap();
        assert_eq!(retry.len(), 1);
        assert_eq!(retry[0].topic(), "bad");
    }

    /// 第一次 Sent 标记失败，之后全部透传
    struct FlakyMarkOutbox {
        inner: InMemoryOutboxStore,
        failed_once: AtomicBool,
    }

    #[async_trait]
    impl crate::outbox::OutboxStore for FlakyMarkOutbox {
        async fn add(&self, record: OutboxRecord) -> DomainResult<()> {
            self.inner.add(record).await
        }

        async fn pull_batch(
            &self,
            limit: usize,
            tenant_id: Option<&str>,
        ) -> DomainResult<Vec<OutboxRecord>> {
            self.inner.pull_batch(limit, tenant_id).await
        }

        async fn mark_published(&self, id: &str) -> DomainResult<()> {
            if !self.failed_once.swap(true, Ordering::SeqCst) {
                return Err(DomainError::Database {
                    reason: "写入失败".into(),
                });
            }
            self.inner.mark_published(id).await
        }

        async fn mark_failed(&self, id: &str, reason: &str) -> DomainResult<OutboxStatus> {
            self.inner.mark_failed(id, reason).await
        }

        async fn requeue_stale(&self, claimed_before: DateTime<Utc>) -> DomainResult<usize> {
            self.inner.requeue_stale(claimed_before).await
        }

        async fn find_by_status(
            &self,
            status: OutboxStatus,
            limit: usize,
        ) -> DomainResult<Vec<OutboxRecord>> {
            self.inner.find_by_status(status, limit).await
        }
    }

    #[tokio::test]
    async fn mark_failure_does_not_abandon_rest_of_batch() {
        let db = InMemoryDatabase::new();
        let outbox = Arc::new(FlakyMarkOutbox {
            inner: InMemoryOutboxStore::new(db),
            failed_once: AtomicBool::new(false),
        });
        outbox.add(record("a")).await.unwrap();
        outbox.add(record("b")).await.unwrap();
        let bus = Arc::new(RecordingBus::new(vec![]));

        let projector = OutboxProjector::builder()
            .outbox(outbox.clone() as Arc<dyn OutboxStore>)
            .bus(bus.clone() as Arc<dyn MessageBus>)
            .build();

        // 第一行的 Sent 标记失败，批次继续；两行都发布成功
        let sent = projector.drain_once().await.unwrap();
        assert_eq!(sent, 2);
        assert_eq!(*bus.published.lock().unwrap(), vec!["a", "b"]);
        let stranded = outbox
            .find_by_status(OutboxStatus::Publishing, 10)
            .await
            .unwrap();
        assert_eq!(stranded.len(), 1);
        assert_eq!(stranded[0].topic(), "a");

        // 在途回收把滞留行放回待发，下一轮补投
        let cutoff = Utc::now() + chrono::Duration::seconds(1);
        assert_eq!(outbox.requeue_stale(cutoff).await.unwrap(), 1);
        let sent = projector.drain_once().await.unwrap();
        assert_eq!(sent, 1);
        assert_eq!(
            outbox.find_by_status(OutboxStatus::Sent, 10).await.unwrap().len(),
            2
        );
    }

    #[tokio::test]
    async fn background_worker_drains_until_shutdown() {
        let db = InMemoryDatabase::new();
        let outbox = Arc::new(InMemoryOutboxStore::new(db.clone()));
        outbox.add(record("a")).await.unwrap();
        let bus = Arc::new(RecordingBus::new(vec![]));

        let projector = Arc::new(
            OutboxProjector::builder()
                .outbox(outbox.clone() as Arc<dyn OutboxStore>)
                .bus(bus.clone() as Arc<dyn MessageBus>)
                .config(ProjectorConfig {
                    poll_interval: Duration::from_millis(10),
                    ..Default::default()
                })
                .build(),
        );

        let handle = projector.start();
        let _ = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if !outbox
                    .find_by_status(OutboxStatus::Sent, 1)
                    .await
                    .unwrap()
                    .is_empty()
                {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        handle.shutdown();
        handle.join().await;

        assert_eq!(*bus.published.lock().unwrap(), vec!["a"]);
    }
}
