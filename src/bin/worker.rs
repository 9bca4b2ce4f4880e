use anyhow::Result;
use montecarlo::app::AppMode;
use montecarlo::common::{run_cli, worker_id_arg};

#[tokio::main]
async fn main() -> Result<()> {
    run_cli(
        "montecarlo-worker",
        "分布式蒙特卡洛模拟 - Worker",
        Some("获取当前模型，从工作队列消费场景并回报结果与统计"),
        vec![worker_id_arg()],
        AppMode::Worker,
        "Worker",
    )
    .await
}
