use serde::Serialize;
use std::fmt;

/// Worker 生命周期
///
/// `Uninitialized → AcquiringModel → Ready → Consuming ⇄ ReloadingModel → Stopped`，
/// 任何状态都可以直接进入 `Stopped`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Uninitialized,
    AcquiringModel,
    Ready,
    Consuming,
    ReloadingModel,
    Stopped,
}

impl WorkerState {
    pub fn can_transition_to(self, next: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, next),
            (Uninitialized, AcquiringModel)
                | (AcquiringModel, Ready)
                | (Ready, Consuming)
                | (Consuming, ReloadingModel)
                | (ReloadingModel, Consuming)
                | (_, Stopped)
        )
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerState::Uninitialized => "uninitialized",
            WorkerState::AcquiringModel => "acquiring_model",
            WorkerState::Ready => "ready",
            WorkerState::Consuming => "consuming",
            WorkerState::ReloadingModel => "reloading_model",
            WorkerState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}
