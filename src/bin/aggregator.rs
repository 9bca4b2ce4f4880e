use anyhow::Result;
use montecarlo::app::AppMode;
use montecarlo::common::{api_args, run_cli};

#[tokio::main]
async fn main() -> Result<()> {
    run_cli(
        "montecarlo-aggregator",
        "分布式蒙特卡洛模拟 - 聚合器",
        Some("汇总结果与Worker统计，并通过看板接口推送实时事件"),
        api_args().to_vec(),
        AppMode::Aggregator,
        "Aggregator",
    )
    .await
}
