pub mod admission;
pub mod agent;
pub mod breaker;
pub mod burst;
pub mod cache;
pub mod config;
pub mod context;
pub mod db;
pub mod errors;
pub mod followup;
pub mod gate;
pub mod metrics;
pub mod models;
pub mod pipeline;
pub mod queue;
pub mod routes;
pub mod supervisor;
pub mod transport;
pub mod worker;

use agent::{EchoReplyEngine, HttpReplyEngine, ReplyEngine};
use config::Config;
use db::Db;
use pipeline::Orchestrator;
use rocket_cors::CorsOptions;
use std::env;
use std::sync::Arc;
use std::time::Duration;
use transport::{HttpTransportSender, TransportSender};
use worker::WorkerPool;

pub fn rocket() -> rocket::Rocket<rocket::Build> {
    let db_path = env::var("DATABASE_PATH").unwrap_or_else(|_| "data/dispatch.db".to_string());
    rocket_with_db(&db_path)
}

pub fn rocket_with_db(db_path: &str) -> rocket::Rocket<rocket::Build> {
    build_rocket(db_path, Config::from_env(), None, None)
}

pub fn rocket_with_config(db_path: &str, config: Config) -> rocket::Rocket<rocket::Build> {
    build_rocket(db_path, config, None, None)
}

/// Test hook: inject a recording transport and a deterministic reply engine.
pub fn rocket_with_overrides(
    db_path: &str,
    config: Config,
    sender: Arc<dyn TransportSender>,
    engine: Arc<dyn ReplyEngine>,
) -> rocket::Rocket<rocket::Build> {
    build_rocket(db_path, config, Some(sender), Some(engine))
}

fn build_rocket(
    db_path: &str,
    config: Config,
    sender_override: Option<Arc<dyn TransportSender>>,
    engine_override: Option<Arc<dyn ReplyEngine>>,
) -> rocket::Rocket<rocket::Build> {
    // Ensure data directory exists
    if let Some(parent) = std::path::Path::new(db_path).parent() {
        std::fs::create_dir_all(parent).ok();
    }

    let db = Arc::new(Db::new(db_path));
    let sender: Arc<dyn TransportSender> = sender_override
        .unwrap_or_else(|| Arc::new(HttpTransportSender::new(config.clone())));
    let engine: Arc<dyn ReplyEngine> = engine_override.unwrap_or_else(|| {
        if config.ai_api_key.is_some() {
            Arc::new(HttpReplyEngine::new(config.clone())) as Arc<dyn ReplyEngine>
        } else {
            println!("🤖 AI_API_KEY not set, replies use the echo engine");
            Arc::new(EchoReplyEngine) as Arc<dyn ReplyEngine>
        }
    });

    let orch = Orchestrator::new(config, db, sender, engine);
    let pool = WorkerPool::new(orch.clone());

    let cors = CorsOptions::default()
        .to_cors()
        .expect("Failed to create CORS");

    let orch_liftoff = orch.clone();
    let pool_liftoff = pool.clone();

    rocket::build()
        .manage(orch)
        .manage(pool)
        .attach(cors)
        .register("/", rocket::catchers![routes::not_found])
        .mount(
            "/",
            rocket::routes![
                routes::webhook_whatsapp,
                routes::webhook_chatwoot,
                routes::test_message,
                routes::health,
                routes::metrics,
                routes::bot_status,
                routes::bot_pause,
                routes::bot_resume,
                routes::bot_resume_all,
                routes::followup_activate,
                routes::followup_deactivate,
                routes::followup_status,
            ],
        )
        .attach(rocket::fairing::AdHoc::on_liftoff(
            "Dispatch Pipeline",
            move |_rocket| {
                Box::pin(async move {
                    // Crash recovery before any loop touches the queue.
                    orch_liftoff.recover();
                    pool_liftoff.start();

                    let sweeper = orch_liftoff.clone();
                    tokio::spawn(async move {
                        let period = Duration::from_millis(sweeper.config.burst_sweep_ms.max(20));
                        loop {
                            tokio::time::sleep(period).await;
                            sweeper.flush_bursts();
                        }
                    });

                    let scheduler = orch_liftoff.clone();
                    tokio::spawn(async move {
                        let period =
                            Duration::from_secs(scheduler.config.followup_tick_secs.max(1));
                        loop {
                            tokio::time::sleep(period).await;
                            scheduler.followups.tick(chrono::Utc::now()).await;
                        }
                    });

                    println!("📬 Dispatch pipeline started");
                })
            },
        ))
        .attach(rocket::fairing::AdHoc::on_shutdown(
            "Drain Workers",
            |rocket| {
                Box::pin(async move {
                    let timeout = rocket
                        .state::<Arc<Orchestrator>>()
                        .map(|o| o.config.drain_timeout_secs)
                        .unwrap_or(30);
                    if let Some(pool) = rocket.state::<Arc<WorkerPool>>() {
                        pool.drain(Duration::from_secs(timeout)).await;
                    }
                })
            },
        ))
}
