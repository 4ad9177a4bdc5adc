//! 应用安装状态聚合
//!
//! 进程内的内存聚合：必须模块集、每个应用最近一次已知状态、
//! 最后更新时间。每次状态上报时重建，被在线上报和重启看门狗读取。

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

/// 单个应用的最近一次已知状态
#[derive(Clone, Debug, Default, Serialize)]
pub struct AppStatus {
    pub installed: bool,
    pub running: bool,
    pub preparing: bool,
    /// 人工停用（副本数显式为 0）
    pub disabled: bool,
}

/// 进程级安装状态聚合
#[derive(Clone, Debug, Serialize)]
pub struct ApplicationInstallationStatus {
    /// 当前 runlevel 的必须模块文件列表
    pub required_modules: Vec<String>,
    /// 应用名 -> 最近状态
    pub apps: HashMap<String, AppStatus>,
    pub last_update: DateTime<Utc>,
}

impl ApplicationInstallationStatus {
    pub fn new() -> Self {
        Self {
            required_modules: Vec::new(),
            apps: HashMap::new(),
            last_update: Utc::now(),
        }
    }

    /// 更新单个应用状态
    pub fn update(&mut self, app_name: &str, status: AppStatus) {
        self.apps.insert(app_name.to_string(), status);
        self.last_update = Utc::now();
    }

    /// 未停用且未运行的应用（看门狗触发集）
    pub fn stalled_apps(&self) -> Vec<String> {
        self.apps
            .iter()
            .filter(|(_, status)| !status.disabled && !status.running)
            .map(|(name, _)| name.clone())
            .collect()
    }
}

impl Default for ApplicationInstallationStatus {
    fn default() -> Self {
        Self::new()
    }
}
