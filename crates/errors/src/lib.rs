use thiserror::Error;

#[cfg(test)]
mod tests;

#[derive(Debug, Error)]
pub enum SimulationError {
    #[error("消息代理连接错误: {0}")]
    Connection(String),
    #[error("队列不存在: {0}")]
    QueueNotFound(String),
    #[error("队列参数不一致: {0}")]
    PreconditionFailed(String),
    #[error("队列 {0} 拒绝了发布的消息")]
    PublishRejected(String),
    #[error("等待模型超时 ({waited_secs}s)")]
    AcquisitionTimeout { waited_secs: u64 },
    #[error("模型编译失败: {0}")]
    Compilation(String),
    #[error("模型验证失败: {0}")]
    ModelVerification(String),
    #[error("场景处理失败: {0}")]
    Processing(String),
    #[error("序列化错误: {0}")]
    Serialization(String),
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("内部错误: {0}")]
    Internal(String),
}

pub type SimulationResult<T> = Result<T, SimulationError>;

impl SimulationError {
    pub fn connection<S: Into<String>>(msg: S) -> Self {
        Self::Connection(msg.into())
    }
    pub fn compilation<S: Into<String>>(msg: S) -> Self {
        Self::Compilation(msg.into())
    }
    pub fn processing<S: Into<String>>(msg: S) -> Self {
        Self::Processing(msg.into())
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }

    /// 传输层错误，调用方按自己的退避策略重试
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SimulationError::Connection(_)
                | SimulationError::QueueNotFound(_)
                | SimulationError::PublishRejected(_)
        )
    }

    /// 在Worker启动阶段出现时必须终止进程
    pub fn is_fatal_at_startup(&self) -> bool {
        matches!(
            self,
            SimulationError::AcquisitionTimeout { .. }
                | SimulationError::Compilation(_)
                | SimulationError::ModelVerification(_)
                | SimulationError::Configuration(_)
        )
    }

    /// 模型本身不可用（同一份源码重试没有意义）
    pub fn is_model_unusable(&self) -> bool {
        matches!(
            self,
            SimulationError::Compilation(_) | SimulationError::ModelVerification(_)
        )
    }
}

impl From<serde_json::Error> for SimulationError {
    fn from(err: serde_json::Error) -> Self {
        SimulationError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for SimulationError {
    fn from(err: anyhow::Error) -> Self {
        SimulationError::Internal(err.to_string())
    }
}
