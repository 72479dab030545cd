// 服务入口：加载配置、初始化日志与存储，挂载任务路由。
use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use todo_server::config::{load_config, Config};
use todo_server::shutdown::shutdown_signal;
use todo_server::state::AppState;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "todo-server", about = "Anonymous personal to-do list web server")]
struct Args {
    /// YAML 配置路径，默认读取 TODO_CONFIG_PATH 或 config/todo.yaml。
    #[arg(long)]
    config: Option<String>,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(args.config.as_deref());
    init_tracing(&config);
    let addr = bind_address(&config, &args);
    let state = Arc::new(AppState::new(config)?);

    let app = todo_server::build_router(state);
    let listener = tokio::net::TcpListener::bind(addr.as_str())
        .await
        .with_context(|| format!("监听地址失败: {addr}"))?;
    info!("任务服务已启动: http://{addr}");

    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal());
    if let Err(err) = server.await {
        warn!("服务退出异常: {err}");
    }

    Ok(())
}

fn init_tracing(config: &Config) {
    let default_level = config.observability.log_level.trim();
    let default_level = if default_level.is_empty() {
        "info".to_string()
    } else {
        default_level.to_lowercase()
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.observability.log_format.trim().eq_ignore_ascii_case("json") {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn bind_address(config: &Config, args: &Args) -> String {
    // 命令行 > 环境变量 > 配置文件。
    let host = args
        .host
        .clone()
        .or_else(|| std::env::var("TODO_HOST").ok())
        .unwrap_or_else(|| config.server.host.clone());
    let port = args
        .port
        .or_else(|| {
            std::env::var("TODO_PORT")
                .ok()
                .and_then(|value| value.parse::<u16>().ok())
        })
        .unwrap_or(config.server.port);
    format!("{host}:{port}")
}
