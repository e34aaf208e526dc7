use crate::common::{test_client, wait_until, whatsapp_body};
use rocket::http::{ContentType, Status};

fn followup_status(
    client: &rocket::local::blocking::Client,
    user: &str,
) -> serde_json::Value {
    client
        .get(format!("/followup/status/{user}"))
        .dispatch()
        .into_json()
        .unwrap()
}

#[test]
fn test_successful_reply_arms_stage_zero() {
    let client = test_client();
    let res = client
        .post("/test/message")
        .header(ContentType::JSON)
        .body(r#"{"user_id": "5493531111111", "message": "hola"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Ok);

    let status = followup_status(&client, "5493531111111");
    let pending = status["pending_jobs"].as_array().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0]["stage"], 0);
}

#[test]
fn test_inbound_message_resets_pending_jobs() {
    let client = test_client();
    let user = "5493532222222";

    // Arm the sequence via a synchronous reply.
    client
        .post("/test/message")
        .header(ContentType::JSON)
        .body(format!(r#"{{"user_id": "{user}", "message": "hola"}}"#))
        .dispatch();
    assert_eq!(
        followup_status(&client, user)["pending_jobs"]
            .as_array()
            .unwrap()
            .len(),
        1
    );

    // A new inbound cancels everything pending immediately at admission.
    client
        .post("/webhook/whatsapp")
        .header(ContentType::JSON)
        .body(whatsapp_body(user, "una consulta mas", "m1"))
        .dispatch();
    // After the worker replies, a fresh stage-0 job is armed.
    assert!(
        wait_until(
            || {
                let status = followup_status(&client, user);
                status["pending_jobs"].as_array().map(|p| p.len()) == Some(1)
            },
            5000
        ),
        "stage-0 job never re-armed"
    );
    assert_eq!(client.outbox.sent_count(), 1);
    let status = followup_status(&client, user);
    assert_eq!(status["pending_jobs"][0]["stage"], 0);
}

#[test]
fn test_deactivate_blacklists_and_cancels() {
    let client = test_client();
    let user = "5493533333333";
    client
        .post("/test/message")
        .header(ContentType::JSON)
        .body(format!(r#"{{"user_id": "{user}", "message": "hola"}}"#))
        .dispatch();

    let res: serde_json::Value = client
        .post(format!("/followup/deactivate/{user}?reason=opt-out"))
        .dispatch()
        .into_json()
        .unwrap();
    assert_eq!(res["active"], false);

    let status = followup_status(&client, user);
    assert_eq!(status["active"], false);
    assert!(status["pending_jobs"].as_array().unwrap().is_empty());

    // While blacklisted, replies do not re-arm the sequence.
    client
        .post("/test/message")
        .header(ContentType::JSON)
        .body(format!(r#"{{"user_id": "{user}", "message": "sigo aca"}}"#))
        .dispatch();
    assert!(followup_status(&client, user)["pending_jobs"]
        .as_array()
        .unwrap()
        .is_empty());

    // Re-activation lifts the blacklist and arms stage 0 again.
    let res: serde_json::Value = client
        .post(format!("/followup/activate/{user}"))
        .dispatch()
        .into_json()
        .unwrap();
    assert_eq!(res["active"], true);
    let status = followup_status(&client, user);
    assert_eq!(status["active"], true);
    assert_eq!(status["pending_jobs"].as_array().unwrap().len(), 1);
}

#[test]
fn test_status_for_unknown_user_is_clean() {
    let client = test_client();
    let status = followup_status(&client, "desconocido");
    assert_eq!(status["active"], true);
    assert!(status["pending_jobs"].as_array().unwrap().is_empty());
    assert_eq!(status["sent_total"], 0);
}
