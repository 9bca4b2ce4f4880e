use crate::*;

#[test]
fn test_simulation_error_display() {
    let connection_error = SimulationError::Connection("connection refused".to_string());
    assert_eq!(connection_error.to_string(), "消息代理连接错误: connection refused");

    let timeout_error = SimulationError::AcquisitionTimeout { waited_secs: 120 };
    assert_eq!(timeout_error.to_string(), "等待模型超时 (120s)");

    let rejected = SimulationError::PublishRejected("escenarios".to_string());
    assert_eq!(rejected.to_string(), "队列 escenarios 拒绝了发布的消息");

    let compilation = SimulationError::compilation("entry point 'model_fn' not found");
    assert_eq!(
        compilation.to_string(),
        "模型编译失败: entry point 'model_fn' not found"
    );
}

#[test]
fn test_retryable_classification() {
    assert!(SimulationError::connection("closed").is_retryable());
    assert!(SimulationError::QueueNotFound("cola_modelo".into()).is_retryable());
    assert!(SimulationError::PublishRejected("escenarios".into()).is_retryable());
    assert!(!SimulationError::compilation("bad").is_retryable());
    assert!(!SimulationError::processing("division by zero").is_retryable());
}

#[test]
fn test_startup_fatal_classification() {
    assert!(SimulationError::AcquisitionTimeout { waited_secs: 1 }.is_fatal_at_startup());
    assert!(SimulationError::compilation("bad").is_fatal_at_startup());
    assert!(SimulationError::ModelVerification("smoke".into()).is_fatal_at_startup());
    assert!(!SimulationError::connection("closed").is_fatal_at_startup());
    assert!(!SimulationError::processing("x").is_fatal_at_startup());
}

#[test]
fn test_model_unusable() {
    assert!(SimulationError::compilation("bad").is_model_unusable());
    assert!(SimulationError::ModelVerification("smoke".into()).is_model_unusable());
    assert!(!SimulationError::AcquisitionTimeout { waited_secs: 30 }.is_model_unusable());
}

#[test]
fn test_from_serde_json_error() {
    let parse_error = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
    let error: SimulationError = parse_error.into();
    assert!(matches!(error, SimulationError::Serialization(_)));
}
