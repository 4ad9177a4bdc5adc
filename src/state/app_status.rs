//! 应用状态存储
//!
//! ApplicationInstallationStatus 的并发封装，调和周期写入，
//! 看门狗和在线上报读取。

use std::sync::RwLock;

use crate::domain::status::{AppStatus, ApplicationInstallationStatus};

/// 应用状态存储
pub struct ApplicationStatusStore {
    inner: RwLock<ApplicationInstallationStatus>,
}

impl ApplicationStatusStore {
    pub fn new() -> Self {
        Self { inner: RwLock::new(ApplicationInstallationStatus::new()) }
    }

    /// 替换必须模块列表（runlevel 变化时调用）
    pub fn set_required_modules(&self, modules: Vec<String>) {
        let mut inner = self.inner.write().unwrap();
        inner.required_modules = modules;
    }

    /// 当前必须模块列表
    pub fn required_modules(&self) -> Vec<String> {
        self.inner.read().unwrap().required_modules.clone()
    }

    /// 更新单个应用状态
    pub fn update(&self, app_name: &str, status: AppStatus) {
        self.inner.write().unwrap().update(app_name, status);
    }

    /// 查询单个应用状态
    pub fn get(&self, app_name: &str) -> Option<AppStatus> {
        self.inner.read().unwrap().apps.get(app_name).cloned()
    }

    /// 未停用且未运行的应用（看门狗触发集）
    pub fn stalled_apps(&self) -> Vec<String> {
        self.inner.read().unwrap().stalled_apps()
    }

    /// 完整快照（在线上报使用）
    pub fn snapshot(&self) -> ApplicationInstallationStatus {
        self.inner.read().unwrap().clone()
    }

    /// 移除一个应用的状态记录
    pub fn remove(&self, app_name: &str) {
        self.inner.write().unwrap().apps.remove(app_name);
    }
}

impl Default for ApplicationStatusStore {
    fn default() -> Self {
        Self::new()
    }
}
