use bot_dispatch::agent::EchoReplyEngine;
use bot_dispatch::config::Config;
use bot_dispatch::transport::RecordingTransportSender;
use rocket::local::blocking::Client;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Wrapper around Client that auto-deletes the temp DB on drop and exposes
/// the recording outbox for assertions.
pub struct TestClient {
    client: Option<Client>,
    db_path: String,
    pub outbox: Arc<RecordingTransportSender>,
}

impl Drop for TestClient {
    fn drop(&mut self) {
        // Drop client first to release the SQLite connection (WAL mode
        // holds the file).
        drop(self.client.take());
        let _ = std::fs::remove_file(&self.db_path);
        let _ = std::fs::remove_file(format!("{}-wal", self.db_path));
        let _ = std::fs::remove_file(format!("{}-shm", self.db_path));
    }
}

impl std::ops::Deref for TestClient {
    type Target = Client;
    fn deref(&self) -> &Client {
        self.client.as_ref().unwrap()
    }
}

/// Config tuned for tests: instant coalescing, fast sweeps, background
/// tickers effectively parked.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.coalesce_window_ms = 0;
    config.coalesce_max_wait_ms = 0;
    config.burst_sweep_ms = 25;
    config.followup_tick_secs = 3600;
    config.scale_interval_secs = 3600;
    config
}

pub fn test_client() -> TestClient {
    test_client_with_config(test_config())
}

pub fn test_client_with_config(config: Config) -> TestClient {
    // Unique temp DB per test (avoids parallel test contention)
    let db_path = format!(
        "/tmp/dispatch_test_{}.db",
        uuid::Uuid::new_v4().to_string().split('-').next().unwrap()
    );
    let outbox = Arc::new(RecordingTransportSender::new());
    let rocket = bot_dispatch::rocket_with_overrides(
        &db_path,
        config,
        outbox.clone(),
        Arc::new(EchoReplyEngine),
    );
    let client = Client::tracked(rocket).expect("valid rocket instance");
    TestClient {
        client: Some(client),
        db_path,
        outbox,
    }
}

/// Poll until `check` passes or the timeout elapses. Returns whether it
/// passed; background workers keep running while the test thread sleeps.
pub fn wait_until<F: Fn() -> bool>(check: F, timeout_ms: u64) -> bool {
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    check()
}

/// WhatsApp-gateway webhook body for an inbound text.
pub fn whatsapp_body(user: &str, text: &str, message_id: &str) -> String {
    serde_json::json!({
        "data": {
            "key": {
                "remoteJid": format!("{user}@s.whatsapp.net"),
                "id": message_id
            },
            "message": { "conversation": text }
        }
    })
    .to_string()
}

/// Chatwoot `conversation_updated` body with the given labels.
pub fn chatwoot_update_body(user: &str, labels: &[&str], status: &str) -> String {
    serde_json::json!({
        "event": "conversation_updated",
        "id": 42,
        "status": status,
        "labels": labels,
        "meta": { "sender": { "phone_number": user } }
    })
    .to_string()
}
