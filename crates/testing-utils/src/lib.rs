//! # Montecarlo Testing Utils
//!
//! 各 crate 测试共用的工具：
//!
//! - **Builders**: 场景、结果、统计的测试数据构造
//! - **Helpers**: 小规模测试配置、模型文件、按条件等待
//! - **Containers**: RabbitMQ 测试容器（需要 Docker）
//!
//! ```toml
//! [dev-dependencies]
//! montecarlo-testing-utils = { path = "../testing-utils" }
//! ```

pub mod builders;
pub mod containers;
pub mod helpers;

pub use builders::*;
pub use containers::*;
pub use helpers::*;
