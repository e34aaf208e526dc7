use crate::common::{test_client, wait_until, whatsapp_body};
use rocket::http::{ContentType, Status};

#[test]
fn test_health_reports_ok_once_workers_are_up() {
    let client = test_client();
    assert!(
        wait_until(
            || {
                let res = client.get("/health").dispatch();
                res.status() == Status::Ok
            },
            5000
        ),
        "health never turned ok"
    );
    let body: serde_json::Value = client.get("/health").dispatch().into_json().unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["store"]["available"], true);
    assert!(body["workers"]["current"].as_u64().unwrap() >= 2);
}

#[test]
fn test_metrics_counters_move_with_traffic() {
    let client = test_client();
    client
        .post("/webhook/whatsapp")
        .header(ContentType::JSON)
        .body(whatsapp_body("5493541111111", "hola", "m1"))
        .dispatch();

    // Follow-up arming is the last step of a successful dispatch; once it
    // shows, every earlier counter must be settled too.
    assert!(wait_until(
        || {
            let m: serde_json::Value = client.get("/metrics").dispatch().into_json().unwrap();
            m["followups"]["armed"].as_u64() == Some(1)
        },
        5000
    ));
    let m: serde_json::Value = client.get("/metrics").dispatch().into_json().unwrap();
    assert_eq!(m["inbound"]["admitted"], 1);
    assert_eq!(m["queue"]["submitted"]["normal"], 1);
    assert_eq!(m["queue"]["acked_success"], 1);
    assert_eq!(m["transport"]["sent"], 1);
}

#[test]
fn test_unknown_route_is_404_json() {
    let client = test_client();
    let res = client.get("/no-such-route").dispatch();
    assert_eq!(res.status(), Status::NotFound);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["error"], "Not found");
}
