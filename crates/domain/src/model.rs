use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ModelState {
    Pending,
    Active,
    Invalidated,
}

/// 模型槽位中的消息体
///
/// 每次发布都生成新的版本号，旧版本随队列删除而失效。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModelVersion {
    pub version: String,
    pub created_at: DateTime<Utc>,
    pub source_text: String,
    pub state: ModelState,
}

impl ModelVersion {
    pub fn new(source_text: impl Into<String>) -> Self {
        Self {
            version: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            source_text: source_text.into(),
            state: ModelState::Pending,
        }
    }

    pub fn activate(mut self) -> Self {
        self.state = ModelState::Active;
        self
    }

    pub fn invalidate(&mut self) {
        self.state = ModelState::Invalidated;
    }

    pub fn is_active(&self) -> bool {
        self.state == ModelState::Active
    }

    /// 日志里使用的短版本号
    pub fn short_id(&self) -> &str {
        short_version(&self.version)
    }
}

pub fn short_version(version: &str) -> &str {
    match version.char_indices().nth(12) {
        Some((idx, _)) => &version[..idx],
        None => version,
    }
}
