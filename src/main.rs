//! Marketplace Gateway 服务主入口

use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use marketplace_gateway::{create_routes, AppState, Config};

/// 命令行参数，优先级高于环境变量
#[derive(Debug, Parser)]
#[command(name = "marketplace-gateway", version, about = "OpenAI 兼容的市场网关")]
struct Cli {
    /// 监听端口
    #[arg(long)]
    port: Option<u16>,

    /// 监听地址
    #[arg(long)]
    host: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志 - 默认INFO等级
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "marketplace_gateway=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    info!("🚀 启动 Marketplace Gateway 服务");

    // 加载配置
    let mut config = Config::load()?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(host) = cli.host {
        config.server.host = host;
    }
    info!("✅ 配置加载成功，市场地址: {}", config.marketplace.base_url);

    let address = format!("{}:{}", config.server.host, config.server.port);

    let state = AppState::init(config).await?;
    let app = create_routes(state.clone());
    info!("✅ 路由创建成功");

    let listener = tokio::net::TcpListener::bind(&address).await?;
    info!("🌐 服务器启动成功，监听地址: {}", address);
    info!("📖 健康检查: http://{}/health", address);

    axum::serve(listener, app)
        .tcp_nodelay(true)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("🛑 接收到关闭信号，正在优雅关闭服务器...");
        })
        .await?;

    state.stop().await;
    info!("👋 服务已停止");

    Ok(())
}
