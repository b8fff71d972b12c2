use std::net::SocketAddr;
use std::sync::Arc;

use secrecy::ExposeSecret;
use sqlx::postgres::PgPoolOptions;
use tokio::net::TcpListener;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use otpgate::{
    config::Config,
    repositories::{IdentityStore, InMemoryIdentityStore, PgIdentityStore},
    router,
    state::AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ログ初期化（JSON形式、環境変数でレベル制御）
    init_tracing();

    tracing::info!("otpgate 起動中...");

    // 設定読み込み
    let config = Config::load().map_err(|e| {
        tracing::error!(error = ?e, "設定の読み込みに失敗");
        anyhow::anyhow!("Failed to load config: {}", e)
    })?;

    tracing::info!(
        host = %config.host,
        port = %config.port,
        otp_ttl_secs = config.otp_ttl_secs,
        otp_max_resends = config.otp_max_resends,
        "設定読み込み完了"
    );

    // サーバーアドレス構築
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|e| {
            tracing::error!(error = ?e, "アドレスのパースに失敗");
            anyhow::anyhow!("Failed to parse address: {}", e)
        })?;

    // CORS レイヤー（設定されている場合のみ）
    let cors = config
        .cors_allowed_origin
        .as_deref()
        .map(router::cors_layer)
        .transpose()
        .map_err(|e| anyhow::anyhow!("Failed to build CORS layer: {}", e))?;

    // ストア選択（DATABASE_URL 未設定ならインメモリ）
    let store = build_store(&config).await?;

    // AppState 構築
    let state = AppState::new(store, &config).map_err(|e| {
        tracing::error!(error = ?e, "AppState の構築に失敗");
        anyhow::anyhow!("Failed to create AppState: {}", e)
    })?;

    // Router 構築
    let app = match cors {
        Some(cors) => router::create_router(state).layer(cors),
        None => router::create_router(state),
    };

    // サーバー起動
    let listener = TcpListener::bind(&addr).await.map_err(|e| {
        tracing::error!(error = ?e, addr = %addr, "ポートのバインドに失敗");
        anyhow::anyhow!("Failed to bind to {}: {}", addr, e)
    })?;

    tracing::info!(addr = %addr, "サーバー起動");

    // Graceful shutdown 対応
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| {
            tracing::error!(error = ?e, "サーバーエラー");
            anyhow::anyhow!("Server error: {}", e)
        })?;

    tracing::info!("サーバー終了");

    Ok(())
}

/// 永続化ストアを構築（スキーマは migrations/ を事前に適用しておくこと）
async fn build_store(config: &Config) -> anyhow::Result<Arc<dyn IdentityStore>> {
    let Some(database_url) = &config.database_url else {
        tracing::warn!("DATABASE_URL 未設定（インメモリストアで起動、再起動でデータは消えます）");
        return Ok(Arc::new(InMemoryIdentityStore::new()));
    };

    let db_pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url.expose_secret())
        .await
        .map_err(|e| {
            tracing::error!(error = ?e, "データベース接続に失敗");
            anyhow::anyhow!("Failed to connect to database: {}", e)
        })?;

    tracing::info!("データベース接続完了");

    Ok(Arc::new(PgIdentityStore::new(db_pool)))
}

/// tracing の初期化（JSON形式）
fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,otpgate=debug"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

/// Graceful shutdown シグナル待機
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = ?e, "Ctrl+C ハンドラーのインストールに失敗");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = ?e, "SIGTERM ハンドラーのインストールに失敗");
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Ctrl+C received, starting graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("SIGTERM received, starting graceful shutdown");
        }
    }
}
