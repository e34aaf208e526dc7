use crate::common::{test_client, test_client_with_config, test_config, wait_until, whatsapp_body};
use bot_dispatch::models::Source;
use rocket::http::{ContentType, Status};

#[test]
fn test_whatsapp_inbound_produces_reply() {
    let client = test_client();
    let res = client
        .post("/webhook/whatsapp")
        .header(ContentType::JSON)
        .body(whatsapp_body("5493511111111", "hola", "m1"))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["status"], "accepted");

    assert!(
        wait_until(|| client.outbox.sent_count() == 1, 5000),
        "reply never dispatched"
    );
    let sent = client.outbox.sent();
    assert_eq!(sent[0].user_id, "5493511111111");
    assert_eq!(sent[0].text, "Recibí tu mensaje: hola");
    assert_eq!(sent[0].source, Source::Whatsapp);
}

#[test]
fn test_duplicate_webhook_replay_sends_once() {
    let client = test_client();
    let body = whatsapp_body("5493512222222", "hola de nuevo", "m1");

    let res = client
        .post("/webhook/whatsapp")
        .header(ContentType::JSON)
        .body(body.clone())
        .dispatch();
    let parsed: serde_json::Value = res.into_json().unwrap();
    assert_eq!(parsed["status"], "accepted");

    // Replays inside the dedup TTL are acknowledged but dropped.
    for _ in 0..2 {
        let res = client
            .post("/webhook/whatsapp")
            .header(ContentType::JSON)
            .body(body.clone())
            .dispatch();
        assert_eq!(res.status(), Status::Ok);
        let parsed: serde_json::Value = res.into_json().unwrap();
        assert_eq!(parsed["status"], "ignored");
        assert_eq!(parsed["reason"], "duplicate");
    }

    assert!(wait_until(|| client.outbox.sent_count() >= 1, 5000));
    std::thread::sleep(std::time::Duration::from_millis(200));
    assert_eq!(client.outbox.sent_count(), 1);
}

#[test]
fn test_burst_coalesces_into_single_reply() {
    let mut config = test_config();
    // Window long enough to cover three quick posts, short enough for tests.
    config.coalesce_window_ms = 400;
    config.coalesce_max_wait_ms = 800;
    let client = test_client_with_config(config);

    for (i, text) in ["hola", "tenes anillos?", "de plata"].iter().enumerate() {
        let res = client
            .post("/webhook/whatsapp")
            .header(ContentType::JSON)
            .body(whatsapp_body("5493513333333", text, &format!("m{i}")))
            .dispatch();
        let parsed: serde_json::Value = res.into_json().unwrap();
        assert_eq!(parsed["status"], "accepted");
    }

    assert!(
        wait_until(|| client.outbox.sent_count() >= 1, 5000),
        "coalesced reply never dispatched"
    );
    std::thread::sleep(std::time::Duration::from_millis(200));
    let sent = client.outbox.sent();
    assert_eq!(sent.len(), 1, "burst must produce exactly one reply");
    assert_eq!(sent[0].text, "Recibí tu mensaje: hola\ntenes anillos?\nde plata");
}

#[test]
fn test_empty_text_is_ignored_with_ok() {
    let client = test_client();
    let res = client
        .post("/webhook/whatsapp")
        .header(ContentType::JSON)
        .body(whatsapp_body("5493514444444", "   ", "m1"))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let parsed: serde_json::Value = res.into_json().unwrap();
    assert_eq!(parsed["status"], "ignored");
    assert_eq!(parsed["reason"], "empty text");
}

#[test]
fn test_chatwoot_inbound_routes_reply_to_conversation() {
    let client = test_client();
    let body = serde_json::json!({
        "event": "message_created",
        "id": 7001,
        "content": "precio del anillo luna?",
        "message_type": "incoming",
        "sender": { "phone_number": "5493515555555" },
        "conversation": { "id": 42 }
    })
    .to_string();
    let res = client
        .post("/webhook/chatwoot")
        .header(ContentType::JSON)
        .body(body)
        .dispatch();
    let parsed: serde_json::Value = res.into_json().unwrap();
    assert_eq!(parsed["status"], "accepted");

    assert!(wait_until(|| client.outbox.sent_count() == 1, 5000));
    let sent = client.outbox.sent();
    assert_eq!(sent[0].source, Source::Chatwoot);
    assert_eq!(sent[0].conversation_id.as_deref(), Some("42"));
}

#[test]
fn test_test_message_is_synchronous() {
    let client = test_client();
    let res = client
        .post("/test/message")
        .header(ContentType::JSON)
        .body(r#"{"user_id": "tester1", "message": "hola bot"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let parsed: serde_json::Value = res.into_json().unwrap();
    assert_eq!(parsed["response"], "Recibí tu mensaje: hola bot");
    // Synchronous path bypasses the transports entirely.
    assert_eq!(client.outbox.sent_count(), 0);
}

#[test]
fn test_test_message_requires_fields() {
    let client = test_client();
    let res = client
        .post("/test/message")
        .header(ContentType::JSON)
        .body(r#"{"user_id": "", "message": "hola"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::BadRequest);
}

#[test]
fn test_user_rate_limit_rejects_with_ok() {
    let mut config = test_config();
    config.user_rate_max = 2;
    let client = test_client_with_config(config);

    for i in 0..2 {
        let res = client
            .post("/webhook/whatsapp")
            .header(ContentType::JSON)
            .body(whatsapp_body("5493516666666", &format!("mensaje {i}"), &format!("m{i}")))
            .dispatch();
        let parsed: serde_json::Value = res.into_json().unwrap();
        assert_eq!(parsed["status"], "accepted");
    }

    let res = client
        .post("/webhook/whatsapp")
        .header(ContentType::JSON)
        .body(whatsapp_body("5493516666666", "uno mas", "m9"))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let parsed: serde_json::Value = res.into_json().unwrap();
    assert_eq!(parsed["status"], "ignored");
    assert_eq!(parsed["reason"], "rate_limited:user");
}
