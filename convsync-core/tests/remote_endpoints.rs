use std::time::Duration;

use mockito::Matcher;
use tempfile::tempdir;

use convsync_core::{
    ConfigurationResolver, DispatchStatus, HttpStatsProbe, ModeRequest, NotificationDispatcher,
    ProbeError, RunConfiguration, RunMode, RunSummary, StatsProbe,
};

fn config(api_url: String) -> RunConfiguration {
    RunConfiguration {
        email: "jean@example.nc".into(),
        password: "secret".into(),
        api_url,
        data_store_id: "annonces_messages_jean".into(),
        max_conversations: 100,
        conversations_per_page: 20,
        ..RunConfiguration::default()
    }
}

#[tokio::test]
async fn stats_probe_sends_partition_header() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/api.php")
        .match_query(Matcher::UrlEncoded("action".into(), "stats".into()))
        .match_header("X-User-Database", "annonces_messages_jean")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"messages": 0, "conversations": 0}"#)
        .create_async()
        .await;

    let probe = HttpStatsProbe::new(Duration::from_secs(5)).unwrap();
    let run = ConfigurationResolver::new(&probe)
        .resolve(
            config(format!("{}/api.php?action=save", server.url())),
            ModeRequest::Auto,
        )
        .await
        .unwrap();

    mock.assert_async().await;
    assert_eq!(run.mode(), RunMode::Full);
    assert_eq!(run.max_pages(), 5);
}

#[tokio::test]
async fn server_errors_mean_smart_mode() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("GET", "/api.php")
        .match_query(Matcher::Any)
        .with_status(500)
        .with_body("boom")
        .create_async()
        .await;

    let probe = HttpStatsProbe::new(Duration::from_secs(5)).unwrap();
    let err = probe
        .message_count(&format!("{}/api.php", server.url()), "db")
        .await
        .unwrap_err();
    assert!(matches!(err, ProbeError::Status(500)));

    let run = ConfigurationResolver::new(&probe)
        .resolve(config(format!("{}/api.php", server.url())), ModeRequest::Auto)
        .await
        .unwrap();
    assert_eq!(run.mode(), RunMode::Smart);
}

#[tokio::test]
async fn unreachable_store_means_smart_mode() {
    let probe = HttpStatsProbe::new(Duration::from_secs(1)).unwrap();
    let run = ConfigurationResolver::new(&probe)
        .resolve(config("http://127.0.0.1:9/api.php".into()), ModeRequest::Auto)
        .await
        .unwrap();
    assert_eq!(run.mode(), RunMode::Smart);
}

#[tokio::test]
async fn summary_is_posted_to_the_user_chat() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/botTOKEN/sendMessage")
        .match_body(Matcher::PartialJson(serde_json::json!({
            "chat_id": "42",
            "parse_mode": "HTML"
        })))
        .with_status(200)
        .with_body(r#"{"ok": true}"#)
        .create_async()
        .await;

    let dir = tempdir().unwrap();
    let registry = dir.path().join("users.json");
    std::fs::write(
        &registry,
        r#"{
            "users": [{"email": "jean@example.nc", "db_name": "annonces_messages_jean", "telegram_chat_id": 42}],
            "telegram": {"bot_token": "TOKEN", "enabled": true},
            "admin_telegram_chat_id": "7"
        }"#,
    )
    .unwrap();

    let dispatcher = NotificationDispatcher::new(&registry).with_api_base(server.url());
    let status = dispatcher
        .dispatch(&RunSummary::new("jean@example.nc", "annonces_messages_jean"))
        .await;

    mock.assert_async().await;
    assert_eq!(
        status,
        DispatchStatus::Sent {
            chat_id: "42".into()
        }
    );
}

#[tokio::test]
async fn messaging_errors_are_swallowed() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("POST", Matcher::Any)
        .with_status(403)
        .with_body(r#"{"ok": false, "description": "Forbidden"}"#)
        .create_async()
        .await;

    let dir = tempdir().unwrap();
    let registry = dir.path().join("users.json");
    std::fs::write(
        &registry,
        r#"{"users": [], "telegram_bot_token": "TOKEN", "admin_telegram_chat_id": 7}"#,
    )
    .unwrap();

    let dispatcher = NotificationDispatcher::new(&registry).with_api_base(server.url());
    let status = dispatcher
        .dispatch(&RunSummary::new("someone@example.nc", "p"))
        .await;
    assert!(matches!(status, DispatchStatus::Failed { reason } if reason.contains("403")));
}

#[tokio::test]
async fn slow_messaging_endpoint_is_abandoned_after_grace() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    let silent = tokio::spawn(async move {
        let mut held = Vec::new();
        loop {
            let (socket, _) = listener.accept().await.unwrap();
            held.push(socket);
        }
    });

    let dir = tempdir().unwrap();
    let registry = dir.path().join("users.json");
    std::fs::write(
        &registry,
        r#"{"users": [], "telegram_bot_token": "TOKEN", "admin_telegram_chat_id": 7}"#,
    )
    .unwrap();

    let started = std::time::Instant::now();
    let status = NotificationDispatcher::new(&registry)
        .with_api_base(format!("http://{address}"))
        .dispatch_detached(
            RunSummary::new("someone@example.nc", "p"),
            Duration::from_millis(200),
        )
        .await;

    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(matches!(status, DispatchStatus::Failed { reason } if reason.contains("pending")));
    silent.abort();
}
