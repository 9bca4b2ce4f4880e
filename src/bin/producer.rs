use anyhow::Result;
use montecarlo::app::AppMode;
use montecarlo::common::{model_file_arg, run_cli};

#[tokio::main]
async fn main() -> Result<()> {
    run_cli(
        "montecarlo-producer",
        "分布式蒙特卡洛模拟 - 生产端",
        Some("发布模型，维持工作队列水位，并在模型文件变化时发布新版本"),
        vec![model_file_arg()],
        AppMode::Producer,
        "Producer",
    )
    .await
}
