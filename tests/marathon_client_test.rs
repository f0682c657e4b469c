//! Marathon client integration tests against wiremock: REST endpoint
//! failover, app decoding, and event-stream handshake validation.

use std::time::Duration;

use tokio::sync::mpsc;
use url::Url;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use marathon_acme::clients::{ClientError, MarathonClient};
use marathon_acme::sse::SseOptions;

fn client(endpoints: &[&str]) -> MarathonClient {
    let endpoints: Vec<Url> = endpoints.iter().map(|e| Url::parse(e).unwrap()).collect();
    MarathonClient::new(endpoints, Duration::from_secs(5), SseOptions::default()).unwrap()
}

fn apps_body(apps: serde_json::Value) -> serde_json::Value {
    serde_json::json!({ "apps": apps })
}

#[tokio::test]
async fn test_get_apps_decodes_labels_and_ports() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/apps"))
        .and(header("Accept", "application/json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(apps_body(serde_json::json!([
            {
                "id": "/my-app",
                "labels": {"HAPROXY_GROUP": "external"},
                "portDefinitions": [{"port": 9000}, {"port": 9001}],
            }
        ]))))
        .expect(1)
        .mount(&server)
        .await;

    let apps = client(&[&server.uri()]).get_apps().await.unwrap();
    assert_eq!(apps.len(), 1);
    assert_eq!(apps[0].id, "/my-app");
    assert_eq!(
        apps[0].labels.get("HAPROXY_GROUP").map(String::as_str),
        Some("external")
    );
    assert_eq!(apps[0].port_definitions.len(), 2);
}

#[tokio::test]
async fn test_get_apps_tolerates_missing_optional_fields() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/apps"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(apps_body(serde_json::json!([{"id": "/bare"}]))),
        )
        .mount(&server)
        .await;

    let apps = client(&[&server.uri()]).get_apps().await.unwrap();
    assert!(apps[0].labels.is_empty());
    assert!(apps[0].port_definitions.is_empty());
}

#[tokio::test]
async fn test_missing_apps_field_is_protocol_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/apps"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"tasks": []})))
        .mount(&server)
        .await;

    let result = client(&[&server.uri()]).get_apps().await;
    assert!(matches!(result, Err(ClientError::Protocol(_))));
}

#[tokio::test]
async fn test_failover_on_server_error() {
    let bad = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/apps"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&bad)
        .await;

    let good = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/apps"))
        .respond_with(ResponseTemplate::new(200).set_body_json(apps_body(serde_json::json!([]))))
        .expect(1)
        .mount(&good)
        .await;

    let apps = client(&[&bad.uri(), &good.uri()]).get_apps().await.unwrap();
    assert!(apps.is_empty());
}

#[tokio::test]
async fn test_failover_on_transport_error() {
    // Nothing listens on port 1.
    let good = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/apps"))
        .respond_with(ResponseTemplate::new(200).set_body_json(apps_body(serde_json::json!([]))))
        .expect(1)
        .mount(&good)
        .await;

    let apps = client(&["http://127.0.0.1:1", &good.uri()])
        .get_apps()
        .await
        .unwrap();
    assert!(apps.is_empty());
}

#[tokio::test]
async fn test_client_error_is_authoritative() {
    let first = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/apps"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&first)
        .await;

    // The second endpoint must not be consulted after a 4xx.
    let second = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/apps"))
        .respond_with(ResponseTemplate::new(200).set_body_json(apps_body(serde_json::json!([]))))
        .expect(0)
        .mount(&second)
        .await;

    let result = client(&[&first.uri(), &second.uri()]).get_apps().await;
    assert!(matches!(result, Err(ClientError::Http { status: 404, .. })));
}

#[tokio::test]
async fn test_all_endpoints_failed() {
    let result = client(&["http://127.0.0.1:1", "http://127.0.0.1:2"])
        .get_apps()
        .await;
    assert!(matches!(result, Err(ClientError::AllEndpointsFailed)));
}

#[tokio::test]
async fn test_event_stream_sends_subscribed_types_as_query() {
    let server = MockServer::start().await;
    let sse_body = concat!(
        "event: api_post_event\n",
        "data: {\"timestamp\":\"2026-08-01T00:00:00Z\"}\n",
        "\n",
    );
    Mock::given(method("GET"))
        .and(path("/v2/events"))
        .and(query_param("event_type", "api_post_event"))
        .and(header("Accept", "text/event-stream"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(sse_body.as_bytes().to_vec(), "text/event-stream"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = client(&[&server.uri()]);
    let stream = client
        .open_event_stream(&["api_post_event".to_string()])
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    stream.run(tx).await.unwrap();

    let event = rx.try_recv().unwrap();
    assert_eq!(event.event_type, "api_post_event");
    assert_eq!(event.data["timestamp"], "2026-08-01T00:00:00Z");
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_event_stream_drops_unsubscribed_types() {
    let server = MockServer::start().await;
    let sse_body = concat!(
        "event: status_update_event\n",
        "data: {\"slaveId\":\"abc\"}\n",
        "\n",
        "event: api_post_event\n",
        "data: {\"timestamp\":\"t\"}\n",
        "\n",
    );
    Mock::given(method("GET"))
        .and(path("/v2/events"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(sse_body.as_bytes().to_vec(), "text/event-stream"),
        )
        .mount(&server)
        .await;

    let client = client(&[&server.uri()]);
    let stream = client
        .open_event_stream(&["api_post_event".to_string()])
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    stream.run(tx).await.unwrap();

    let event = rx.try_recv().unwrap();
    assert_eq!(event.event_type, "api_post_event");
    assert!(rx.try_recv().is_err(), "unsubscribed event must be dropped");
}

#[tokio::test]
async fn test_event_stream_rejects_wrong_content_type() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/events"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(b"data: x\n\n".to_vec(), "text/plain"))
        .mount(&server)
        .await;

    let result = client(&[&server.uri()])
        .open_event_stream(&["api_post_event".to_string()])
        .await;
    assert!(matches!(result, Err(ClientError::Protocol(_))));
}

#[tokio::test]
async fn test_event_stream_rejects_non_200() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/events"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let result = client(&[&server.uri()])
        .open_event_stream(&["api_post_event".to_string()])
        .await;
    assert!(matches!(result, Err(ClientError::Http { status: 204, .. })));
}

#[tokio::test]
async fn test_event_stream_undecodable_json_fails_stream() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/events"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(b"event: api_post_event\ndata: not json\n\n".to_vec(), "text/event-stream"),
        )
        .mount(&server)
        .await;

    let client = client(&[&server.uri()]);
    let stream = client
        .open_event_stream(&["api_post_event".to_string()])
        .await
        .unwrap();

    let (tx, _rx) = mpsc::unbounded_channel();
    let result = stream.run(tx).await;
    assert!(matches!(result, Err(ClientError::Protocol(_))));
}
