use std::fmt;

use crate::services::backend::BackendError;

/// 配置事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigEventKind {
    Loaded,
    Changed,
    Errored,
}

impl ConfigEventKind {
    pub fn name(&self) -> &'static str {
        match self {
            ConfigEventKind::Loaded => "Config Load",
            ConfigEventKind::Changed => "Config Watch Change",
            ConfigEventKind::Errored => "Config op Error",
        }
    }
}

impl fmt::Display for ConfigEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 推送给应用的配置事件
#[derive(Debug)]
pub struct ConfigEvent {
    pub data_id: String,
    pub group: String,
    pub kind: ConfigEventKind,
    pub content: String,
    pub error: Option<BackendError>,
}

impl ConfigEvent {
    pub fn loaded(data_id: &str, group: &str, content: String) -> Self {
        Self {
            data_id: data_id.to_string(),
            group: group.to_string(),
            kind: ConfigEventKind::Loaded,
            content,
            error: None,
        }
    }

    pub fn changed(data_id: &str, group: &str, content: String) -> Self {
        Self {
            data_id: data_id.to_string(),
            group: group.to_string(),
            kind: ConfigEventKind::Changed,
            content,
            error: None,
        }
    }

    pub fn errored(data_id: &str, group: &str, error: BackendError) -> Self {
        Self {
            data_id: data_id.to_string(),
            group: group.to_string(),
            kind: ConfigEventKind::Errored,
            content: String::new(),
            error: Some(error),
        }
    }

    pub fn is_error(&self) -> bool {
        self.kind == ConfigEventKind::Errored
    }
}

/// 配置事件通道容量
pub const DEFAULT_EVENT_CAPACITY: usize = 64;
