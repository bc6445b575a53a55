//! 模块注册表：按依赖声明编排模块生命周期
//!
//! 模块声明名称与依赖，注册表做深度优先拓扑排序：启动按依赖序，
//! 关闭按启动序的逆序。缺失依赖与依赖环在解析时报错（环报错带
//! 完整路径），解析结果缓存，新注册使缓存失效。
//!
//! 模块之间通过 [`ServiceContainer`]（按类型索引的共享服务表）交换
//! 服务，注册时放入，后续模块启动时取用。

use async_trait::async_trait;
use dashmap::DashMap;
use keel_domain::error::{DomainError, DomainResult};
use std::any::{Any, TypeId};
use std::sync::{Arc, Mutex};

/// 按类型索引的共享服务表
#[derive(Default)]
pub struct ServiceContainer {
    services: DashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl ServiceContainer {
    pub fn new() -> Self {
        Self::default()
    }

    /// 放入服务（同类型覆盖）
    pub fn insert<T: Send + Sync + 'static>(&self, service: Arc<T>) {
        self.services.insert(TypeId::of::<T>(), service);
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.services
            .get(&TypeId::of::<T>())
            .and_then(|s| Arc::clone(s.value()).downcast::<T>().ok())
    }

    pub fn contains<T: Send + Sync + 'static>(&self) -> bool {
        self.services.contains_key(&TypeId::of::<T>())
    }
}

/// 模块协议
#[async_trait]
pub trait Module: Send + Sync {
    fn name(&self) -> &'static str;

    /// 依赖的模块名（启动顺序在其之后）
    fn requires(&self) -> Vec<&'static str> {
        Vec::new()
    }

    /// 注册回调：向容器放入本模块提供的服务
    fn on_register(&self, _services: &ServiceContainer) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_startup(&self, _services: &ServiceContainer) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_shutdown(&self, _services: &ServiceContainer) -> anyhow::Result<()> {
        Ok(())
    }
}

/// 模块注册表
#[derive(Default)]
pub struct ModuleRegistry {
    modules: Vec<Arc<dyn Module>>,
    services: ServiceContainer,
    /// 缓存的启动顺序（modules 下标），新注册时失效
    order: Mutex<Option<Vec<usize>>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn services(&self) -> &ServiceContainer {
        &self.services
    }

    /// 注册模块：重名报错，注册即触发 `on_register`
    pub fn register(&mut self, module: Arc<dyn Module>) -> DomainResult<()> {
        if self.modules.iter().any(|m| m.name() == module.name()) {
            return Err(DomainError::AlreadyExists {
                reason: format!("模块重复注册: {}", module.name()),
            });
        }
        module
            .on_register(&self.services)
            .map_err(|e| DomainError::Validation {
                reason: format!("模块 {} 注册失败: {e}", module.name()),
            })?;
        self.modules.push(module);
        *self.order.lock().expect("模块顺序缓存锁中毒") = None;
        Ok(())
    }

    /// 解析启动顺序（深度优先拓扑排序，带缓存）
    pub fn resolve_order(&self) -> DomainResult<Vec<&'static str>> {
        let indices = self.resolve_indices()?;
        Ok(indices.iter().map(|&i| self.modules[i].name()).collect())
    }

    fn resolve_indices(&self) -> DomainResult<Vec<usize>> {
        let mut cached = self.order.lock().expect("模块顺序缓存锁中毒");
        if let Some(order) = cached.as_ref() {
            return Ok(order.clone());
        }

        // 0 未访问 / 1 在路径上 / 2 已完成
        let mut color = vec![0u8; self.modules.len()];
        let mut order = Vec::with_capacity(self.modules.len());
        let mut path: Vec<&'static str> = Vec::new();

        for i in 0..self.modules.len() {
            self.visit(i, &mut color, &mut order, &mut path)?;
        }

        *cached = Some(order.clone());
        Ok(order)
    }

    fn visit(
        &self,
        index: usize,
        color: &mut [u8],
        order: &mut Vec<usize>,
        path: &mut Vec<&'static str>,
    ) -> DomainResult<()> {
        match color[index] {
            2 => return Ok(()),
            1 => {
                let mut cycle = path.clone();
                cycle.push(self.modules[index].name());
                return Err(DomainError::ModuleCycle {
                    path: cycle.join(" -> "),
                });
            }
            _ => {}
        }

        color[index] = 1;
        path.push(self.modules[index].name());
        for dep in self.modules[index].requires() {
            let Some(dep_index) = self.modules.iter().position(|m| m.name() == dep) else {
                return Err(DomainError::ModuleNotFound {
                    module: self.modules[index].name().to_string(),
                    requires: dep.to_string(),
                });
            };
            self.visit(dep_index, color, order, path)?;
        }
        path.pop();
        color[index] = 2;
        order.push(index);
        Ok(())
    }

    /// 按依赖序启动全部模块
    pub async fn startup(&self) -> DomainResult<()> {
        for &i in &self.resolve_indices()? {
            let module = &self.modules[i];
            tracing::info!(module = module.name(), "模块启动");
            module
                .on_startup(&self.services)
                .await
                .map_err(|e| DomainError::Validation {
                    reason: format!("模块 {} 启动失败: {e}", module.name()),
                })?;
        }
        Ok(())
    }

    /// 按启动序的逆序关闭全部模块；单个失败只记日志不中断
    pub async fn shutdown(&self) -> DomainResult<()> {
        for &i in self.resolve_indices()?.iter().rev() {
            let module = &self.modules[i];
            tracing::info!(module = module.name(), "模块关闭");
            if let Err(e) = module.on_shutdown(&self.services).await {
                tracing::warn!(module = module.name(), error = %e, "模块关闭失败");
            }
        }
        Ok(())
    }
}
