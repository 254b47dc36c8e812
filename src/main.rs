use std::{env, net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::Result;
use axum::{middleware, routing::get, Router};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use guardrail::adapters::http::protect;
use guardrail::config::ProtectionConfig;
use guardrail::rules::RuleRegistry;
use guardrail::sweep::idle_sweep_loop;
use guardrail::ProtectionEngine;

static DEFAULT_CONFIG_PATH: &str = "config.yaml";

async fn demo_ok() -> &'static str {
    "ok"
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
        .with_target(true)
        .compact()
        .init();

    let cfg_path = env::var("GUARDRAIL_CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let cfg_path = PathBuf::from(cfg_path);
    let cfg = ProtectionConfig::load_from_path(&cfg_path)?;
    info!("loaded protection config ({} rate-limit rules, {} breaker rules)",
        cfg.rate_limit_rules.len(), cfg.circuit_breakers.len());

    let registry = Arc::new(RuleRegistry::new());
    let engine = Arc::new(ProtectionEngine::new(registry));
    load_rules_into(&engine, &cfg)?;
    engine.set_enabled(cfg.enabled);

    // Idle sweep: reclaim per-resource state untouched for five minutes,
    // checked once a minute.
    {
        let engine = engine.clone();
        tokio::spawn(async move {
            idle_sweep_loop(engine, 60_000, 300_000).await;
        });
    }

    // Config watcher: reconcile rules in place on any change, without
    // restarting the process.
    {
        let engine = engine.clone();
        let cfg_path = cfg_path.clone();
        tokio::spawn(async move {
            if let Err(e) = watch_config_and_apply(cfg_path, engine).await {
                error!("config watcher error: {:?}", e);
            }
        });
    }

    let bind_addr = env::var("GUARDRAIL_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let addr: SocketAddr = bind_addr.parse()?;

    let router = Router::new()
        .route("/health", get(demo_ok))
        .route("/api/v1/demo", get(demo_ok))
        .layer(middleware::from_fn_with_state(engine.clone(), protect))
        .with_state(engine);

    info!("listening on http://{}", addr);
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}

fn load_rules_into(engine: &ProtectionEngine, cfg: &ProtectionConfig) -> Result<()> {
    let (rate_limits, breakers) = cfg.to_rules()?;
    for rule in rate_limits {
        engine.add_or_replace_rate_limit(rule)?;
    }
    for rule in breakers {
        engine.add_or_replace_circuit_breaker(rule)?;
    }
    Ok(())
}

async fn watch_config_and_apply(cfg_path: PathBuf, engine: Arc<ProtectionEngine>) -> Result<()> {
    use tokio::sync::mpsc;
    let (tx, mut rx) = mpsc::channel::<()>(8);

    let mut watcher: RecommendedWatcher = Watcher::new(
        move |res: std::result::Result<Event, notify::Error>| {
            if let Ok(ev) = res {
                match ev.kind {
                    EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_) => {
                        let _ = tx.try_send(());
                    }
                    _ => {}
                }
            }
        },
        notify::Config::default(),
    )?;

    let watch_dir = cfg_path.parent().unwrap_or_else(|| std::path::Path::new("."));
    watcher.watch(watch_dir, RecursiveMode::NonRecursive)?;

    loop {
        rx.recv().await;
        match ProtectionConfig::load_from_path(&cfg_path) {
            Ok(new_cfg) => match load_rules_into(&engine, &new_cfg) {
                Ok(()) => {
                    engine.set_enabled(new_cfg.enabled);
                    info!("applied new protection config (hot reload)");
                }
                Err(e) => warn!("rejected reloaded config: {:?}", e),
            },
            Err(e) => {
                error!("failed to reload config: {:?}", e);
            }
        }
    }
}
