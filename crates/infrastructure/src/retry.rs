//! 重试策略
//!
//! 代理层本身不做重试，各调用方按自己的预算组合 `RetryPolicy` 和 `WaitBudget`。
//! 时间统一取自 tokio 时钟，测试中可以暂停并推进。

use montecarlo_errors::SimulationResult;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// None 表示无限重试
    pub max_attempts: Option<u32>,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            max_attempts: None,
            delay,
        }
    }

    pub fn bounded(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: Some(max_attempts.max(1)),
            delay,
        }
    }

    pub fn start(&self) -> RetryState {
        RetryState {
            policy: self.clone(),
            failures: 0,
        }
    }

    /// 执行操作直到成功或尝试次数用完，返回最后一次的错误
    pub async fn run<T, F, Fut>(&self, operation: &str, mut attempt: F) -> SimulationResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = SimulationResult<T>>,
    {
        let mut state = self.start();
        loop {
            match attempt(state.failures + 1).await {
                Ok(value) => return Ok(value),
                Err(e) => match state.next_delay() {
                    Some(delay) => {
                        warn!(
                            "{} 失败 (第{}次): {}，{:?} 后重试",
                            operation, state.failures, e, delay
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(e),
                },
            }
        }
    }
}

/// 一次重试过程的状态
#[derive(Debug, Clone)]
pub struct RetryState {
    policy: RetryPolicy,
    failures: u32,
}

impl RetryState {
    /// 记录一次失败；返回 None 表示不再重试
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.failures += 1;
        match self.policy.max_attempts {
            Some(max) if self.failures >= max => None,
            _ => Some(self.policy.delay),
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }
}

/// 按墙钟时间计算的等待预算
#[derive(Debug, Clone, Copy)]
pub struct WaitBudget {
    started: Instant,
    budget: Duration,
}

impl WaitBudget {
    pub fn new(budget: Duration) -> Self {
        Self {
            started: Instant::now(),
            budget,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.elapsed())
    }

    pub fn is_exhausted(&self) -> bool {
        self.elapsed() >= self.budget
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }
}
