use anyhow::Result;
use clap::Arg;
use montecarlo::app::AppMode;
use montecarlo::common::{
    api_args, base_command, model_file_arg, start_application, worker_id_arg, StartupConfig,
};

#[tokio::main]
async fn main() -> Result<()> {
    let matches = base_command("montecarlo", "基于消息代理的分布式蒙特卡洛模拟系统")
        .arg(
            Arg::new("mode")
                .short('m')
                .long("mode")
                .value_name("MODE")
                .help("运行模式")
                .value_parser(["producer", "worker", "aggregator"])
                .required(true),
        )
        .arg(worker_id_arg())
        .arg(model_file_arg())
        .args(api_args())
        .get_matches();

    let mode: AppMode = matches
        .get_one::<String>("mode")
        .map(String::as_str)
        .unwrap_or_default()
        .parse()?;

    start_application(StartupConfig::from_matches(&matches), mode, "montecarlo").await
}
