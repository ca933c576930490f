//! 分桶租约协调
//!
//! 期望分桶集合由一致性哈希环计算，实际所有权一律以租约后端为准：
//! 环只决定"该去抢哪些桶"，抢没抢到看CAS结果。
//! 所有权变化通过 `BucketAcquired` / `BucketLost` 通知触发引擎，
//! `BucketLost` 对引擎是硬停止信号。

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use jobflow_core::config::BucketConfig;
use jobflow_core::SchedulerResult;
use jobflow_domain::messages::SchedulerMessage;
use jobflow_domain::repositories::{LeaseBackend, MembershipView};

/// FNV-1a 64位哈希，与集群内其他实现保持一致
fn fnv1a64(bytes: &[u8]) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = FNV_OFFSET;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// 一致性哈希环，每个成员映射为若干虚拟节点
#[derive(Debug, Clone)]
pub struct HashRing {
    ring: BTreeMap<u64, String>,
}

impl HashRing {
    pub fn new(members: &[String], virtual_nodes: u32) -> Self {
        let mut ring = BTreeMap::new();
        for member in members {
            for i in 0..virtual_nodes {
                let key = fnv1a64(format!("{member}#{i}").as_bytes());
                ring.insert(key, member.clone());
            }
        }
        Self { ring }
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// 分桶顺时针归属的成员
    pub fn owner_of(&self, bucket_id: i32) -> Option<&str> {
        if self.ring.is_empty() {
            return None;
        }
        let key = fnv1a64(format!("bucket-{bucket_id}").as_bytes());
        self.ring
            .range(key..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, member)| member.as_str())
    }
}

/// 本节点的分桶协调器
pub struct BucketCoordinator {
    node_address: String,
    config: BucketConfig,
    lease_backend: Arc<dyn LeaseBackend>,
    membership: Arc<dyn MembershipView>,
    engine_tx: mpsc::UnboundedSender<SchedulerMessage>,
    owned: HashSet<i32>,
}

impl BucketCoordinator {
    pub fn new(
        node_address: String,
        config: BucketConfig,
        lease_backend: Arc<dyn LeaseBackend>,
        membership: Arc<dyn MembershipView>,
        engine_tx: mpsc::UnboundedSender<SchedulerMessage>,
    ) -> Self {
        Self {
            node_address,
            config,
            lease_backend,
            membership,
            engine_tx,
            owned: HashSet::new(),
        }
    }

    pub fn owned_buckets(&self) -> &HashSet<i32> {
        &self.owned
    }

    /// 协调循环：周期性对齐期望集合并续期
    ///
    /// 续期失败不是致命错误，下一轮会重试；租约真正过期时
    /// renew返回false，按正常的 `BucketLost` 处理。
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.renew_interval_seconds));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.rebalance().await {
                        warn!("分桶再平衡失败，下轮重试: {e}");
                    }
                    self.renew_all().await;
                }
                changed = shutdown.changed() => {
                    // 发送端被丢弃等同于停机
                    if changed.is_err() || *shutdown.borrow() {
                        info!("分桶协调器收到停机信号，释放 {} 个租约", self.owned.len());
                        self.release_all().await;
                        return;
                    }
                }
            }
        }
    }

    /// 按最新成员视图对齐期望分桶集合
    pub async fn rebalance(&mut self) -> SchedulerResult<()> {
        let members = self.membership.alive_schedulers().await?;
        let ring = HashRing::new(&members, self.config.virtual_nodes);
        if ring.is_empty() {
            warn!("成员视图为空，保持现有租约不变");
            return Ok(());
        }

        let desired: HashSet<i32> = (0..self.config.count as i32)
            .filter(|&b| ring.owner_of(b) == Some(self.node_address.as_str()))
            .collect();
        let ttl = Duration::from_secs(self.config.lease_ttl_seconds);

        // 先释放不再归属的桶，再抢新归属的桶
        let to_release: Vec<i32> = self.owned.difference(&desired).copied().collect();
        for bucket_id in to_release {
            if let Err(e) = self
                .lease_backend
                .release(bucket_id, &self.node_address)
                .await
            {
                warn!("释放分桶 {bucket_id} 租约失败: {e}");
            }
            self.drop_bucket(bucket_id);
        }

        let to_acquire: Vec<i32> = desired.difference(&self.owned).copied().collect();
        for bucket_id in to_acquire {
            match self
                .lease_backend
                .try_acquire(bucket_id, &self.node_address, ttl)
                .await
            {
                Ok(true) => {
                    self.owned.insert(bucket_id);
                    info!("获得分桶 {bucket_id} 的租约");
                    self.notify(SchedulerMessage::BucketAcquired { bucket_id });
                }
                Ok(false) => {
                    // 前任owner的租约还没过期，等它自然到期
                    debug!("分桶 {bucket_id} 仍被其他节点持有");
                }
                Err(e) => {
                    warn!("获取分桶 {bucket_id} 租约失败: {e}");
                }
            }
        }
        Ok(())
    }

    /// 续期全部持有的租约，续期是幂等的
    pub async fn renew_all(&mut self) {
        let ttl = Duration::from_secs(self.config.lease_ttl_seconds);
        let buckets: Vec<i32> = self.owned.iter().copied().collect();
        for bucket_id in buckets {
            match self
                .lease_backend
                .renew(bucket_id, &self.node_address, ttl)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    error!("分桶 {bucket_id} 租约已丢失");
                    self.drop_bucket(bucket_id);
                }
                Err(e) => {
                    // 后端暂时不可达：保留本地状态，等下一轮；
                    // 真丢了会在租约过期后以renew=false的形式显现
                    warn!("续期分桶 {bucket_id} 租约失败，下轮重试: {e}");
                }
            }
        }
    }

    pub async fn release_all(&mut self) {
        let buckets: Vec<i32> = self.owned.iter().copied().collect();
        for bucket_id in buckets {
            if let Err(e) = self
                .lease_backend
                .release(bucket_id, &self.node_address)
                .await
            {
                warn!("释放分桶 {bucket_id} 租约失败: {e}");
            }
            self.drop_bucket(bucket_id);
        }
    }

    fn drop_bucket(&mut self, bucket_id: i32) {
        if self.owned.remove(&bucket_id) {
            self.notify(SchedulerMessage::BucketLost { bucket_id });
        }
    }

    fn notify(&self, message: SchedulerMessage) {
        if self.engine_tx.send(message).is_err() {
            warn!("触发引擎信道已关闭，分桶事件丢弃");
        }
    }
}
