// 配置验证
// 每个配置段实现 ConfigValidator，AppConfig 负责汇总

use crate::{ConfigError, ConfigResult};

/// Trait for configuration validation
pub trait ConfigValidator {
    fn validate(&self) -> ConfigResult<()>;
}

/// 通用字段校验工具
pub struct ValidationUtils;

impl ValidationUtils {
    /// 验证字符串非空
    pub fn validate_not_empty(value: &str, field_name: &str) -> ConfigResult<()> {
        if value.trim().is_empty() {
            return Err(ConfigError::Validation(format!(
                "{field_name} cannot be empty"
            )));
        }
        Ok(())
    }

    /// 验证数值大于0
    pub fn validate_positive(value: u64, field_name: &str) -> ConfigResult<()> {
        if value == 0 {
            return Err(ConfigError::Validation(format!(
                "{field_name} must be greater than 0"
            )));
        }
        Ok(())
    }

    /// 验证超时时间在合理范围内
    pub fn validate_timeout_seconds(timeout_seconds: u64, field_name: &str) -> ConfigResult<()> {
        if timeout_seconds == 0 {
            return Err(ConfigError::Validation(format!(
                "{field_name} must be greater than 0"
            )));
        }
        if timeout_seconds > 3600 {
            return Err(ConfigError::Validation(format!(
                "{field_name} must be less than or equal to 3600"
            )));
        }
        Ok(())
    }

    /// 验证AMQP地址
    pub fn validate_amqp_url(url: &str, field_name: &str) -> ConfigResult<()> {
        Self::validate_not_empty(url, field_name)?;
        if !url.starts_with("amqp://") && !url.starts_with("amqps://") {
            return Err(ConfigError::Validation(format!(
                "{field_name} must start with amqp:// or amqps://"
            )));
        }
        Ok(())
    }

    /// 验证监听地址格式 host:port
    pub fn validate_bind_address(address: &str, field_name: &str) -> ConfigResult<()> {
        address
            .parse::<std::net::SocketAddr>()
            .map(|_| ())
            .map_err(|e| ConfigError::Validation(format!("{field_name} is invalid: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_not_empty() {
        assert!(ValidationUtils::validate_not_empty("escenarios", "queues.scenarios").is_ok());
        assert!(ValidationUtils::validate_not_empty("  ", "queues.scenarios").is_err());
    }

    #[test]
    fn test_validate_amqp_url() {
        assert!(ValidationUtils::validate_amqp_url("amqp://localhost:5672", "broker.url").is_ok());
        assert!(ValidationUtils::validate_amqp_url("amqps://host", "broker.url").is_ok());
        assert!(ValidationUtils::validate_amqp_url("redis://localhost", "broker.url").is_err());
    }

    #[test]
    fn test_validate_timeout_seconds() {
        assert!(ValidationUtils::validate_timeout_seconds(30, "t").is_ok());
        assert!(ValidationUtils::validate_timeout_seconds(0, "t").is_err());
        assert!(ValidationUtils::validate_timeout_seconds(3601, "t").is_err());
    }

    #[test]
    fn test_validate_bind_address() {
        assert!(ValidationUtils::validate_bind_address("0.0.0.0:5000", "api.bind_address").is_ok());
        assert!(ValidationUtils::validate_bind_address("localhost", "api.bind_address").is_err());
    }
}
