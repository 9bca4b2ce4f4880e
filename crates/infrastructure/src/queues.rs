//! 各组件共用的队列规格
//!
//! 同一个队列可能由任意一方首先创建（先被动检查、不存在再声明），
//! 所以声明参数必须在所有进程中保持一致。

use montecarlo_config::ProducerConfig;

use crate::broker::{OverflowPolicy, PublishOptions, QueueArguments, QueueSpec};

/// 持久化、有长度上限、满时拒绝发布的工作队列
pub fn work_queue_spec(name: &str, config: &ProducerConfig) -> QueueSpec {
    QueueSpec::durable(name).with_arguments(QueueArguments {
        max_length: Some(config.max_scenarios),
        message_ttl_ms: Some(config.scenario_ttl_ms),
        overflow: Some(OverflowPolicy::RejectPublish),
        lazy: true,
    })
}

pub fn results_queue_spec(name: &str) -> QueueSpec {
    QueueSpec::durable(name)
}

pub fn stats_queue_spec(name: &str) -> QueueSpec {
    QueueSpec::transient(name)
}

pub fn dashboard_queue_spec(name: &str) -> QueueSpec {
    QueueSpec::transient(name)
}

pub fn results_publish_options() -> PublishOptions {
    PublishOptions::persistent()
}
