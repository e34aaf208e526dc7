use crate::common::{chatwoot_update_body, test_client, wait_until, whatsapp_body};
use rocket::http::{ContentType, Status};

fn metrics(client: &rocket::local::blocking::Client) -> serde_json::Value {
    client.get("/metrics").dispatch().into_json().unwrap()
}

#[test]
fn test_paused_user_is_skipped_without_outbound() {
    let client = test_client();

    let res = client.post("/bot/pause/5493521111111?reason=handoff").dispatch();
    assert_eq!(res.status(), Status::Ok);

    let res = client
        .post("/webhook/whatsapp")
        .header(ContentType::JSON)
        .body(whatsapp_body("5493521111111", "precio?", "m1"))
        .dispatch();
    let parsed: serde_json::Value = res.into_json().unwrap();
    assert_eq!(parsed["status"], "accepted");

    // The item completes as a paused skip; nothing goes out.
    assert!(
        wait_until(
            || metrics(&client)["workers"]["paused_skips"].as_u64() == Some(1),
            5000
        ),
        "worker never skipped the paused user"
    );
    assert_eq!(client.outbox.sent_count(), 0);
}

#[test]
fn test_pause_by_tag_then_force_activate() {
    let client = test_client();
    let user = "5493522222222";

    // Human tags the conversation: bot goes quiet.
    client
        .post("/webhook/chatwoot")
        .header(ContentType::JSON)
        .body(chatwoot_update_body(user, &["bot-paused"], "open"))
        .dispatch();
    let status: serde_json::Value = client
        .get(format!("/bot/status/{user}"))
        .dispatch()
        .into_json()
        .unwrap();
    assert_eq!(status["paused"], true);
    assert_eq!(status["reason"], "tag");

    client
        .post("/webhook/whatsapp")
        .header(ContentType::JSON)
        .body(whatsapp_body(user, "sigo esperando", "m1"))
        .dispatch();
    assert!(wait_until(
        || metrics(&client)["workers"]["paused_skips"].as_u64() == Some(1),
        5000
    ));
    assert_eq!(client.outbox.sent_count(), 0);

    // bot-active tag flips it back on.
    client
        .post("/webhook/chatwoot")
        .header(ContentType::JSON)
        .body(chatwoot_update_body(user, &["bot-active"], "open"))
        .dispatch();
    let status: serde_json::Value = client
        .get(format!("/bot/status/{user}"))
        .dispatch()
        .into_json()
        .unwrap();
    assert_eq!(status["paused"], false);

    client
        .post("/webhook/whatsapp")
        .header(ContentType::JSON)
        .body(whatsapp_body(user, "hola otra vez", "m2"))
        .dispatch();
    assert!(
        wait_until(|| client.outbox.sent_count() == 1, 5000),
        "reply after force-activate never dispatched"
    );
    assert_eq!(client.outbox.sent()[0].text, "Recibí tu mensaje: hola otra vez");
}

#[test]
fn test_private_note_pause_sends_courtesy_notice() {
    let client = test_client();
    let body = serde_json::json!({
        "event": "message_created",
        "id": 8001,
        "content": "/bot pause",
        "message_type": "outgoing",
        "private": true,
        "conversation": {
            "id": 42,
            "meta": { "sender": { "phone_number": "5493523333333" } }
        }
    })
    .to_string();
    client
        .post("/webhook/chatwoot")
        .header(ContentType::JSON)
        .body(body)
        .dispatch();

    let status: serde_json::Value = client
        .get("/bot/status/5493523333333")
        .dispatch()
        .into_json()
        .unwrap();
    assert_eq!(status["paused"], true);
    assert_eq!(status["reason"], "private-note");

    // Courtesy message went to the user through the conversation.
    assert!(wait_until(|| client.outbox.sent_count() == 1, 2000));
    let sent = client.outbox.sent();
    assert_eq!(sent[0].conversation_id.as_deref(), Some("42"));
    assert!(sent[0].text.contains("asesor"));
}

#[test]
fn test_resume_and_resume_all() {
    let client = test_client();
    client.post("/bot/pause/u1").dispatch();
    client.post("/bot/pause/u2").dispatch();

    let res: serde_json::Value = client.post("/bot/resume/u1").dispatch().into_json().unwrap();
    assert_eq!(res["paused"], false);
    let status: serde_json::Value = client.get("/bot/status/u1").dispatch().into_json().unwrap();
    assert_eq!(status["paused"], false);

    let res: serde_json::Value = client.post("/bot/resume-all").dispatch().into_json().unwrap();
    assert_eq!(res["resumed"], 1);
    let status: serde_json::Value = client.get("/bot/status/u2").dispatch().into_json().unwrap();
    assert_eq!(status["paused"], false);
}

#[test]
fn test_unknown_user_status_defaults_to_active() {
    let client = test_client();
    let status: serde_json::Value = client
        .get("/bot/status/nunca-escribio")
        .dispatch()
        .into_json()
        .unwrap();
    assert_eq!(status["paused"], false);
}
