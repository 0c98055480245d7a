mod common;

use actix_web::http::StatusCode;
use actix_web::{App, test as actix_test, web};
use chat_dispatch::backend::StaticRegistry;
use chat_dispatch::error::FailureResult;
use chat_dispatch::server::{json_config, routes};
use common::{ScriptedSession, TestContext};
use serde_json::json;

macro_rules! app {
    ($ctx:expr) => {
        actix_test::init_service(
            App::new()
                .app_data(web::Data::new($ctx.dispatcher.clone()))
                .app_data(json_config(1024))
                .configure(routes),
        )
        .await
    };
}

fn context() -> TestContext {
    TestContext::new(
        ScriptedSession::streaming(&["Hi", "Hi there"]),
        StaticRegistry::default(),
    )
}

#[actix_web::test]
async fn test_health() {
    let ctx = context();
    let app = app!(ctx);
    let req = actix_test::TestRequest::get().uri("/health").to_request();
    let resp = actix_test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(actix_test::read_body(resp).await, "Ok");
}

#[actix_web::test]
async fn test_chat_modes() {
    let ctx = context();
    let app = app!(ctx);
    let req = actix_test::TestRequest::get()
        .uri("/v1/chat/modes")
        .to_request();
    let body: serde_json::Value = actix_test::call_and_read_body_json(&app, req).await;
    let modes = body["data"].as_array().unwrap();
    assert_eq!(modes.len(), 8);
    assert!(modes.contains(&json!("chat_with_db_execute")));
}

#[actix_web::test]
async fn test_completions_stream() {
    let ctx = context();
    let app = app!(ctx);
    let req = actix_test::TestRequest::post()
        .uri("/api/v1/chat/completions")
        .set_json(json!({
            "conv_uid": "conv-9",
            "chat_mode": "chat_normal",
            "model_name": "test-model",
            "user_input": "hello",
            "incremental": true
        }))
        .to_request();
    let resp = actix_test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers().get("content-type").unwrap(),
        "text/event-stream"
    );
    assert_eq!(resp.headers().get("cache-control").unwrap(), "no-cache");

    let body = actix_test::read_body(resp).await;
    let body = String::from_utf8(body.to_vec()).unwrap();
    let frames: Vec<String> = body
        .split_inclusive("\n\n")
        .map(str::to_string)
        .collect();
    assert_eq!(common::delta_text(&frames), "Hi there");
    assert!(body.ends_with("data: [DONE]\n\n"));
    assert!(body.contains(r#""id":"conv-9""#));
    assert_eq!(ctx.history.calls().len(), 3);
}

#[actix_web::test]
async fn test_full_text_stream() {
    let ctx = TestContext::new(
        ScriptedSession::streaming(&["line", "line\nnext"]),
        StaticRegistry::default(),
    );
    let app = app!(ctx);
    let req = actix_test::TestRequest::post()
        .uri("/api/v1/chat/completions")
        .set_json(json!({ "chat_mode": "chat_normal", "user_input": "hello" }))
        .to_request();
    let body = actix_test::call_and_read_body(&app, req).await;
    assert_eq!(body, "data:line\n\ndata:line\\nnext\n\n");
}

#[actix_web::test]
async fn test_routing_failures_are_json() {
    let ctx = context();
    let app = app!(ctx);
    let cases = [
        (json!({ "chat_mode": "chat_unknown" }), StatusCode::BAD_REQUEST, "E0001"),
        (
            json!({ "chat_mode": "chat_with_db_qa", "select_param": "" }),
            StatusCode::BAD_REQUEST,
            "E0002",
        ),
        (
            json!({ "chat_mode": "chat_knowledge", "select_param": "nowhere" }),
            StatusCode::NOT_FOUND,
            "E0003",
        ),
    ];
    for (payload, status, code) in cases {
        let req = actix_test::TestRequest::post()
            .uri("/api/v1/chat/completions")
            .set_json(&payload)
            .to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), status, "{}", payload);
        let failure: FailureResult = actix_test::read_body_json(resp).await;
        assert!(!failure.success);
        assert_eq!(failure.err_code, code);
    }
    assert_eq!(ctx.chats_created(), 0);
}

#[actix_web::test]
async fn test_bad_payloads() {
    let ctx = context();
    let app = app!(ctx);

    let req = actix_test::TestRequest::post()
        .uri("/api/v1/chat/completions")
        .insert_header(("content-type", "application/json"))
        .set_payload("{not json")
        .to_request();
    let resp = actix_test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let req = actix_test::TestRequest::post()
        .uri("/api/v1/chat/completions")
        .set_json(json!({ "user_input": "x".repeat(4096) }))
        .to_request();
    let resp = actix_test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
}
