//! 共享内存数据库（InMemoryDatabase）
//!
//! 测试、示例与本地开发用的存储后端：按实体类型分表存放序列化记录
//! （含版本列），并持有 Outbox 表与其全局位点。
//!
//! 关键性质：全部状态在单一互斥锁之下 ——
//! - `apply`：工作单元提交时的记录写入与 Outbox 追加在一次加锁内
//!   全量校验、全量落库（全有或全无），等价于一个数据库事务；
//! - `outbox_claim`：领取与状态翻转同锁完成，即"条件更新并返回"。
//!
use crate::outbox::{OutboxRecord, OutboxStatus};
use chrono::{DateTime, Utc};
use keel_domain::error::{DomainError, DomainResult};
use keel_domain::specification::{
    Aggregation, CompositeSpecification, Stat, StatFunc, compare_by_sorts, compare_values,
    field_value,
};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

/// 存储形态的一行记录：序列化载荷加版本列
#[derive(Debug, Clone)]
pub struct StoredRecord {
    pub value: Value,
    pub version: usize,
}

/// 工作单元暂存的单个写操作
#[derive(Debug, Clone)]
pub(crate) enum StagedWrite {
    Upsert {
        table: String,
        id: String,
        value: Value,
        /// 更新时的乐观锁校验值；插入为 None
        expected_version: Option<usize>,
        new_version: usize,
        /// true 表示插入（要求 id 不存在）
        create: bool,
    },
    Delete {
        table: String,
        id: String,
    },
}

/// 工作单元的暂存区：提交前的全部写入与 Outbox 行
#[derive(Debug, Default)]
pub(crate) struct Staging {
    pub open: bool,
    pub writes: Vec<StagedWrite>,
    pub outbox: Vec<OutboxRecord>,
}

/// 一次工作单元的会话句柄：共享数据库与暂存区
#[derive(Clone)]
pub struct TxSession {
    db: InMemoryDatabase,
    staging: Arc<Mutex<Staging>>,
}

impl TxSession {
    pub(crate) fn new(db: InMemoryDatabase) -> Self {
        Self {
            db,
            staging: Arc::new(Mutex::new(Staging {
                open: true,
                writes: Vec::new(),
                outbox: Vec::new(),
            })),
        }
    }

    pub(crate) fn db(&self) -> &InMemoryDatabase {
        &self.db
    }

    pub(crate) fn staging(&self) -> &Arc<Mutex<Staging>> {
        &self.staging
    }

    /// 关闭暂存区并取出其内容（提交或回滚时调用，此后写入报错）
    pub(crate) fn close(&self) -> (Vec<StagedWrite>, Vec<OutboxRecord>) {
        let mut staging = self.staging.lock().expect("事务暂存区锁中毒");
        staging.open = false;
        (
            std::mem::take(&mut staging.writes),
            std::mem::take(&mut staging.outbox),
        )
    }
}

#[derive(Default)]
struct DbState {
    tables: HashMap<String, BTreeMap<String, StoredRecord>>,
    outbox: BTreeMap<i64, OutboxRecord>,
    outbox_seq: i64,
}

/// 共享内存数据库
#[derive(Clone, Default)]
pub struct InMemoryDatabase {
    inner: Arc<Mutex<DbState>>,
}

impl InMemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DbState> {
        self.inner.lock().expect("数据库锁中毒")
    }

    // --- 记录表 ---

    pub fn get(&self, table: &str, id: &str) -> Option<StoredRecord> {
        self.lock().tables.get(table)?.get(id).cloned()
    }

    pub fn scan(&self, table: &str) -> Vec<(String, StoredRecord)> {
        self.lock()
            .tables
            .get(table)
            .map(|t| t.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }

    pub(crate) fn insert(
        &self,
        table: &str,
        id: &str,
        value: Value,
        version: usize,
    ) -> DomainResult<()> {
        let mut state = self.lock();
        let rows = state.tables.entry(table.to_string()).or_default();
        if rows.contains_key(id) {
            return Err(DomainError::AlreadyExists {
                reason: format!("{table}/{id}"),
            });
        }
        rows.insert(id.to_string(), StoredRecord { value, version });
        Ok(())
    }

    pub(crate) fn update(
        &self,
        table: &str,
        id: &str,
        value: Value,
        expected_version: Option<usize>,
        new_version: usize,
    ) -> DomainResult<()> {
        let mut state = self.lock();
        let rows = state.tables.entry(table.to_string()).or_default();
        let Some(existing) = rows.get_mut(id) else {
            return Err(DomainError::NotFound {
                reason: format!("{table}/{id}"),
            });
        };
        if let Some(expected) = expected_version
            && existing.version != expected
        {
            return Err(DomainError::VersionConflict {
                expected,
                actual: existing.version,
            });
        }
        *existing = StoredRecord {
            value,
            version: new_version,
        };
        Ok(())
    }

    pub(crate) fn delete(&self, table: &str, id: &str) -> bool {
        self.lock()
            .tables
            .get_mut(table)
            .is_some_and(|rows| rows.remove(id).is_some())
    }

    /// 事务性落库：先全量校验，再全量应用，同锁之内全有或全无。
    /// 同批内的先序写入对后序校验可见（先插后改同一 id 合法）。
    pub(crate) fn apply(
        &self,
        writes: Vec<StagedWrite>,
        outbox: Vec<OutboxRecord>,
    ) -> DomainResult<()> {
        let mut state = self.lock();

        // 校验阶段：以叠加视图模拟本批写入的净效果
        let mut overlay: HashMap<(String, String), Option<usize>> = HashMap::new();
        for write in &writes {
            let (table, id) = match write {
                StagedWrite::Upsert { table, id, .. } | StagedWrite::Delete { table, id } => {
                    (table, id)
                }
            };
            let key = (table.clone(), id.clone());
            let current = overlay.get(&key).copied().unwrap_or_else(|| {
                state
                    .tables
                    .get(table)
                    .and_then(|rows| rows.get(id))
                    .map(|r| r.version)
            });

            match write {
                StagedWrite::Upsert {
                    create: true,
                    new_version,
                    ..
                } => {
                    if current.is_some() {
                        return Err(DomainError::AlreadyExists {
                            reason: format!("{table}/{id}"),
                        });
                    }
                    overlay.insert(key, Some(*new_version));
                }
                StagedWrite::Upsert {
                    create: false,
                    expected_version,
                    new_version,
                    ..
                } => {
                    let Some(actual) = current else {
                        return Err(DomainError::NotFound {
                            reason: format!("{table}/{id}"),
                        });
                    };
                    if let Some(expected) = expected_version
                        && actual != *expected
                    {
                        return Err(DomainError::VersionConflict {
                            expected: *expected,
                            actual,
                        });
                    }
                    overlay.insert(key, Some(*new_version));
                }
                StagedWrite::Delete { .. } => {
                    overlay.insert(key, None);
                }
            }
        }

        // 应用阶段：此后不再失败
        for write in writes {
            match write {
                StagedWrite::Upsert {
                    table,
                    id,
                    value,
                    new_version,
                    ..
                } => {
                    state.tables.entry(table).or_default().insert(
                        id,
                        StoredRecord {
                            value,
                            version: new_version,
                        },
                    );
                }
                StagedWrite::Delete { table, id } => {
                    if let Some(rows) = state.tables.get_mut(&table) {
                        rows.remove(&id);
                    }
                }
            }
        }
        for mut record in outbox {
            state.outbox_seq += 1;
            let seq = state.outbox_seq;
            record.set_sequence(seq);
            state.outbox.insert(seq, record);
        }
        Ok(())
    }

    // --- Outbox 表 ---

    pub(crate) fn outbox_append(&self, records: Vec<OutboxRecord>) {
        let mut state = self.lock();
        for mut record in records {
            state.outbox_seq += 1;
            let seq = state.outbox_seq;
            record.set_sequence(seq);
            state.outbox.insert(seq, record);
        }
    }

    /// 原子领取：同锁内筛选 New 行、翻转为 Publishing 并返回，按位点升序
    pub(crate) fn outbox_claim(&self, limit: usize, tenant_id: Option<&str>) -> Vec<OutboxRecord> {
        let mut state = self.lock();
        let now = Utc::now();
        let mut claimed = Vec::new();
        for record in state.outbox.values_mut() {
            if claimed.len() >= limit {
                break;
            }
            if record.status() != OutboxStatus::New {
                continue;
            }
            if let Some(tenant) = tenant_id
                && record.tenant_id() != Some(tenant)
            {
                continue;
            }
            record.mark_claimed(now);
            claimed.push(record.clone());
        }
        claimed
    }

    /// 在途回收：领取时间早于 `claimed_before` 仍未落标记的 Publishing 行放回 New
    pub(crate) fn outbox_requeue_stale(&self, claimed_before: DateTime<Utc>) -> usize {
        let mut state = self.lock();
        let mut requeued = 0;
        for record in state.outbox.values_mut() {
            if record.status() == OutboxStatus::Publishing
                && record.claimed_at().is_some_and(|at| at < claimed_before)
            {
                record.requeue();
                requeued += 1;
            }
        }
        requeued
    }

    pub(crate) fn outbox_mark_published(&self, id: &str) -> DomainResult<()> {
        let mut state = self.lock();
        let Some(record) = state.outbox.values_mut().find(|r| r.record_id() == id) else {
            return Err(DomainError::NotFound {
                reason: format!("outbox/{id}"),
            });
        };
        record.mark_sent(Utc::now());
        Ok(())
    }

    pub(crate) fn outbox_mark_failed(
        &self,
        id: &str,
        reason: &str,
        max_attempts: u32,
    ) -> DomainResult<OutboxStatus> {
        let mut state = self.lock();
        let Some(record) = state.outbox.values_mut().find(|r| r.record_id() == id) else {
            return Err(DomainError::NotFound {
                reason: format!("outbox/{id}"),
            });
        };
        // Sent/Dead 为终态，失败标记幂等
        match record.status() {
            OutboxStatus::Sent | OutboxStatus::Dead => Ok(record.status()),
            _ => Ok(record.mark_retry(reason, max_attempts)),
        }
    }

    pub(crate) fn outbox_find_by_status(
        &self,
        status: OutboxStatus,
        limit: usize,
    ) -> Vec<OutboxRecord> {
        self.lock()
            .outbox
            .values()
            .filter(|r| r.status() == status)
            .take(limit)
            .cloned()
            .collect()
    }

    /// 全部 Outbox 行（测试与排查）
    pub fn outbox_rows(&self) -> Vec<OutboxRecord> {
        self.lock().outbox.values().cloned().collect()
    }
}

// --- 规约在行集合上的执行（内存实现与事务叠加视图共用） ---

/// 过滤、排序、分页，与 `CompositeSpecification::is_satisfied_by` 同语义
pub(crate) fn filter_sort_page(rows: Vec<Value>, spec: &CompositeSpecification) -> Vec<Value> {
    let mut rows: Vec<Value> = rows
        .into_iter()
        .filter(|row| spec.is_satisfied_by(row))
        .collect();

    if !spec.sorts().is_empty() {
        rows.sort_by(|a, b| compare_by_sorts(a, b, spec.sorts()));
    }

    if let Some(page) = spec.page() {
        let offset = page.offset() as usize;
        let size = page.size as usize;
        rows = rows.into_iter().skip(offset).take(size).collect();
    }

    rows
}

/// 仅过滤（count/exists 用，不受分页影响）
pub(crate) fn filter_only(rows: Vec<Value>, spec: &CompositeSpecification) -> Vec<Value> {
    rows.into_iter()
        .filter(|row| spec.is_satisfied_by(row))
        .collect()
}

fn stat_name(stat: &Stat) -> String {
    let func = match stat.func {
        StatFunc::Count => "count",
        StatFunc::Sum => "sum",
        StatFunc::Avg => "avg",
        StatFunc::Min => "min",
        StatFunc::Max => "max",
    };
    format!("{func}_{}", stat.field)
}

/// 分组聚合：按 group-by 字段分桶，计算统计项，套用 having 过滤。
/// 输出行包含分组字段与 `{func}_{field}` 形式的统计字段。
pub(crate) fn run_aggregation(rows: &[Value], aggregation: &Aggregation) -> Vec<Value> {
    let mut buckets: BTreeMap<String, (serde_json::Map<String, Value>, Vec<&Value>)> =
        BTreeMap::new();

    for row in rows {
        let mut key_fields = serde_json::Map::new();
        for field in &aggregation.group_by {
            let value = field_value(row, field).cloned().unwrap_or(Value::Null);
            key_fields.insert(field.clone(), value);
        }
        let key = serde_json::to_string(&key_fields).unwrap_or_default();
        buckets
            .entry(key)
            .or_insert_with(|| (key_fields, Vec::new()))
            .1
            .push(row);
    }

    let mut out = Vec::new();
    for (_, (key_fields, members)) in buckets {
        let mut row = key_fields;
        for stat in &aggregation.stats {
            let values: Vec<&Value> = members
                .iter()
                .filter_map(|m| field_value(m, &stat.field))
                .filter(|v| !v.is_null())
                .collect();
            let value = match stat.func {
                StatFunc::Count => Value::from(values.len() as u64),
                StatFunc::Sum | StatFunc::Avg => {
                    let nums: Vec<f64> = values.iter().filter_map(|v| v.as_f64()).collect();
                    if nums.is_empty() {
                        Value::Null
                    } else {
                        let sum: f64 = nums.iter().sum();
                        match stat.func {
                            StatFunc::Avg => Value::from(sum / nums.len() as f64),
                            _ => Value::from(sum),
                        }
                    }
                }
                StatFunc::Min | StatFunc::Max => {
                    let mut best: Option<&Value> = None;
                    for v in &values {
                        best = match best {
                            None => Some(v),
                            Some(b) => match compare_values(v, b) {
                                Some(std::cmp::Ordering::Less)
                                    if stat.func == StatFunc::Min =>
                                {
                                    Some(v)
                                }
                                Some(std::cmp::Ordering::Greater)
                                    if stat.func == StatFunc::Max =>
                                {
                                    Some(v)
                                }
                                _ => Some(b),
                            },
                        };
                    }
                    best.cloned().unwrap_or(Value::Null)
                }
            };
            row.insert(stat_name(stat), value);
        }

        let row = Value::Object(row);
        if aggregation.having.iter().all(|f| f.is_satisfied_by(&row)) {
            out.push(row);
        }
    }

    out
}
