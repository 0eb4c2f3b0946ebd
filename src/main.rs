pub mod config;
pub mod credential;
pub mod dispatch;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod pool;
pub mod strategy;
pub mod upstream;
pub mod usage;
pub mod util;

#[cfg(test)]
mod testing;

use anyhow::Context;
use config::PoolBackendKind;
use credential::PoolBackend;
use credential::sqlite::SqliteBackend;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = config::Config::load();

    init_tracing(&cfg);

    let backend: Arc<dyn PoolBackend> = match cfg.pool_backend {
        PoolBackendKind::Memory => Arc::new(credential::MemoryBackend::new(
            cfg.provider_pools_file_path.clone(),
        )),
        PoolBackendKind::Sqlite => Arc::new(
            SqliteBackend::open(&cfg.database_path, cfg.provider_pools_file_path.clone())
                .await
                .context("初始化 SQLite 后端失败")?,
        ),
    };

    let upstream: Arc<dyn upstream::Upstream> =
        Arc::new(upstream::HttpUpstream::new(&cfg).context("初始化上游客户端失败")?);
    let usage = usage::UsageCache::new(
        upstream.clone(),
        cfg.usage_cache_ttl(),
        cfg.usage_query_concurrency,
    );
    let pool = pool::PoolHandle::load(backend, upstream, usage, cfg.max_error_count)
        .await
        .context("加载实例池失败")?;

    // 后台任务：探活（启动即跑一轮）、token 刷新、定期落盘。
    let cancel = CancellationToken::new();
    let mut tasks: Vec<JoinHandle<()>> = vec![pool::health_check::spawn_health_scheduler(
        pool.clone(),
        cfg.health_check_interval(),
        cfg.health_check_concurrency,
        cfg.health_check_timeout(),
        cancel.clone(),
    )];
    if cfg.cron_refresh_token {
        tasks.push(credential::refresh_task::spawn_refresh_scheduler(
            pool.clone(),
            cfg.cron_near(),
            cancel.clone(),
        ));
    }
    tasks.push(pool::persist::spawn_persist_task(
        pool.clone(),
        cfg.persist_interval(),
        cancel.clone(),
    ));

    let dispatcher = dispatch::Dispatcher::from_config(pool.clone(), &cfg);
    let state = gateway::GatewayState::new(cfg.clone(), dispatcher);
    let app = gateway::router(state);

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], cfg.port)));

    tracing::info!(
        backend = pool.backend_name(),
        instances = pool.current().len(),
        "Server listening on http://{addr}"
    );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("绑定监听端口失败")?;

    let serve_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    cancel.cancel();
    wait_tasks(tasks, cfg.shutdown_grace()).await;
    pool::persist::flush(&pool).await;

    serve_result.context("服务异常退出")?;
    Ok(())
}

/// 在宽限期内等待后台任务退出，超时则强制中止。
async fn wait_tasks(tasks: Vec<JoinHandle<()>>, grace: Duration) {
    let aborts: Vec<_> = tasks.iter().map(JoinHandle::abort_handle).collect();
    let all = futures::future::join_all(tasks);
    if tokio::time::timeout(grace, all).await.is_err() {
        tracing::warn!(grace_secs = grace.as_secs(), "后台任务未在宽限期内退出，强制中止");
        for handle in aborts {
            handle.abort();
        }
    }
}

fn init_tracing(cfg: &config::Config) {
    // DEBUG=off 时整体静默；否则依赖库默认 warn，本项目至少 info，
    // 避免环境里预设的 RUST_LOG=warn 把关键日志过滤掉。
    let debug = cfg.debug.trim().to_lowercase();
    let filter = if debug == "off" {
        EnvFilter::new("off")
    } else {
        let env = std::env::var("RUST_LOG").unwrap_or_default();
        let env = env.trim();
        if env.is_empty() {
            EnvFilter::new("warn,pool2api=info")
        } else if env.contains("pool2api") {
            EnvFilter::new(env)
        } else {
            EnvFilter::new(format!("{env},pool2api=info"))
        }
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .try_init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "注册 SIGTERM 监听失败");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("收到退出信号，准备关闭服务...");
}
