use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, Command};
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

use jobflow_core::config::AppConfig;
use jobflow_core::logging::init_logging;

mod app;

use app::Application;

#[tokio::main]
async fn main() -> Result<()> {
    // 解析命令行参数
    let matches = Command::new("jobflow")
        .version("1.0.0")
        .about("分布式任务调度内核")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径")
                .default_value("config/jobflow.toml"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别")
                .value_parser(["trace", "debug", "info", "warn", "error"])
                .default_value("info"),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式")
                .value_parser(["json", "pretty"])
                .default_value("pretty"),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config").expect("有默认值");
    let log_level = matches.get_one::<String>("log-level").expect("有默认值");
    let log_format = matches.get_one::<String>("log-format").expect("有默认值");

    init_logging(log_level, log_format)?;

    info!("启动分布式任务调度内核");
    info!("配置文件: {config_path}");

    let config =
        AppConfig::load(config_path).with_context(|| format!("加载配置失败: {config_path}"))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let app = Application::new(config);
    let app_handle = tokio::spawn(async move {
        if let Err(e) = app.run(shutdown_rx).await {
            error!("应用运行失败: {e}");
        }
    });

    wait_for_shutdown_signal().await;
    info!("收到关闭信号，开始优雅关闭...");
    let _ = shutdown_tx.send(true);

    match tokio::time::timeout(Duration::from_secs(30), app_handle).await {
        Ok(result) => {
            if let Err(e) = result {
                error!("应用关闭时发生错误: {e}");
            } else {
                info!("应用已优雅关闭");
            }
        }
        Err(_) => {
            warn!("应用关闭超时，强制退出");
        }
    }

    info!("调度内核已退出");
    Ok(())
}

/// 等待关闭信号
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("安装Ctrl+C信号处理器失败");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("安装SIGTERM信号处理器失败")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("收到Ctrl+C信号");
        },
        _ = terminate => {
            info!("收到SIGTERM信号");
        },
    }
}
