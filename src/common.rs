use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, ArgMatches, Command};
use montecarlo_config::AppConfig;
use montecarlo_observability::init_metrics;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::app::{AppMode, Application};
use crate::shutdown::{wait_for_shutdown_signal, ShutdownManager};

/// 命令行给出的启动参数，未给出的项沿用配置文件
#[derive(Debug, Clone, Default)]
pub struct StartupConfig {
    pub config_path: Option<String>,
    pub log_level: Option<String>,
    pub log_format: Option<String>,
    pub worker_id: Option<String>,
    pub model_file: Option<String>,
    pub api_bind: Option<String>,
    pub disable_api: bool,
}

impl StartupConfig {
    pub fn from_matches(matches: &ArgMatches) -> Self {
        let string = |id: &str| {
            matches
                .try_get_one::<String>(id)
                .ok()
                .flatten()
                .cloned()
        };
        Self {
            config_path: string("config"),
            log_level: string("log-level"),
            log_format: string("log-format"),
            worker_id: string("worker-id"),
            model_file: string("model-file"),
            api_bind: string("api-bind"),
            disable_api: matches
                .try_get_one::<bool>("no-api")
                .ok()
                .flatten()
                .copied()
                .unwrap_or(false),
        }
    }
}

/// 初始化日志系统，RUST_LOG 优先于给定级别
pub fn init_logging(log_level: &str, log_format: &str) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    match log_format {
        "json" => {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .context("初始化JSON日志格式失败")?;
        }
        "pretty" => {
            registry
                .with(tracing_subscriber::fmt::layer().pretty())
                .try_init()
                .context("初始化Pretty日志格式失败")?;
        }
        _ => {
            return Err(anyhow::anyhow!("不支持的日志格式: {log_format}"));
        }
    }

    Ok(())
}

/// 主机名加进程号，保证同一台机器上的多个 Worker 互不冲突
pub fn default_worker_id() -> String {
    let host = hostname::get()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "worker".to_string());
    format!("{}-{}", host, std::process::id())
}

/// 加载应用配置并应用命令行覆盖
pub fn load_config(startup_config: &StartupConfig) -> Result<AppConfig> {
    let mut config = AppConfig::load(startup_config.config_path.as_deref())
        .context("加载配置失败")?;

    if let Some(worker_id) = &startup_config.worker_id {
        config.worker.worker_id = worker_id.clone();
    }
    if config.worker.worker_id.trim().is_empty() {
        config.worker.worker_id = default_worker_id();
    }
    if let Some(model_file) = &startup_config.model_file {
        config.producer.model_file = model_file.clone();
    }
    if let Some(bind) = &startup_config.api_bind {
        config.api.bind_address = bind.clone();
    }
    if startup_config.disable_api {
        config.api.enabled = false;
    }
    if let Some(level) = &startup_config.log_level {
        config.observability.log_level = level.clone();
    }
    if let Some(format) = &startup_config.log_format {
        config.observability.log_format = format.clone();
    }

    Ok(config)
}

/// 启动应用程序的通用函数
pub async fn start_application(
    startup_config: StartupConfig,
    app_mode: AppMode,
    service_name: &str,
) -> Result<()> {
    let config = load_config(&startup_config)?;
    init_logging(
        &config.observability.log_level,
        &config.observability.log_format,
    )?;

    info!("启动 {} 服务", service_name);
    info!("运行模式: {:?}", app_mode);
    if app_mode == AppMode::Worker {
        info!("Worker ID: {}", config.worker.worker_id);
    }

    if let Some(address) = &config.observability.metrics_bind_address {
        init_metrics(address)?;
    }

    let app = Arc::new(Application::new(config, app_mode));
    let shutdown_manager = ShutdownManager::new();

    let mut app_handle: JoinHandle<Result<()>> = {
        let shutdown_rx = shutdown_manager.subscribe().await;
        let app = Arc::clone(&app);
        tokio::spawn(async move { app.run(shutdown_rx).await })
    };

    tokio::select! {
        outcome = &mut app_handle => {
            // 未收到信号就结束，通常是启动阶段的致命错误
            return match outcome {
                Ok(result) => result,
                Err(e) => Err(anyhow::anyhow!("{} 服务任务异常终止: {}", service_name, e)),
            };
        }
        _ = wait_for_shutdown_signal() => {}
    }

    info!("收到关闭信号，开始优雅关闭...");
    shutdown_manager.shutdown().await;

    match tokio::time::timeout(Duration::from_secs(30), app_handle).await {
        Ok(Ok(Ok(()))) => info!("{} 服务已优雅关闭", service_name),
        Ok(Ok(Err(e))) => {
            error!("{} 服务关闭时发生错误: {:#}", service_name, e);
            return Err(e);
        }
        Ok(Err(e)) => error!("应用关闭时发生错误: {e}"),
        Err(_) => warn!("{} 服务关闭超时，强制退出", service_name),
    }

    Ok(())
}

/// 所有入口共享的命令行参数
pub fn base_command(name: &'static str, about: &'static str) -> Command {
    Command::new(name)
        .version(env!("CARGO_PKG_VERSION"))
        .about(about)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径，缺省时按默认位置查找"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别")
                .value_parser(["trace", "debug", "info", "warn", "error"]),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式")
                .value_parser(["json", "pretty"]),
        )
}

pub fn worker_id_arg() -> Arg {
    Arg::new("worker-id")
        .short('w')
        .long("worker-id")
        .value_name("ID")
        .help("Worker标识，缺省为 主机名-进程号")
}

pub fn model_file_arg() -> Arg {
    Arg::new("model-file")
        .long("model-file")
        .value_name("FILE")
        .help("模型源文件路径")
}

pub fn api_args() -> [Arg; 2] {
    [
        Arg::new("api-bind")
            .long("api-bind")
            .value_name("ADDR")
            .help("看板接口监听地址"),
        Arg::new("no-api")
            .long("no-api")
            .action(clap::ArgAction::SetTrue)
            .help("不启动看板接口"),
    ]
}

/// 单一模式入口的通用启动流程
pub async fn run_cli(
    name: &'static str,
    about: &'static str,
    long_about: Option<&'static str>,
    custom_args: Vec<Arg>,
    app_mode: AppMode,
    service_name: &str,
) -> Result<()> {
    let mut command = base_command(name, about);
    if let Some(long_about) = long_about {
        command = command.long_about(long_about);
    }
    let matches = command.args(custom_args).get_matches();

    start_application(StartupConfig::from_matches(&matches), app_mode, service_name).await
}
