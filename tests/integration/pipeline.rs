//! End-to-end pipeline tests: config definitions through the registry to
//! real sink implementations.

use std::sync::Arc;
use std::time::Duration;

use healthwatch::config::Config;
use healthwatch::registry::Registry;
use healthwatch::sinks::network::NetworkSink;
use healthwatch::checks::http::HttpChecker;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

mod helpers;
use helpers::*;

fn registry_with_http(checker: &Arc<HttpChecker>) -> Registry {
    let mut registry = Registry::new();
    registry.register_check_constructor("http", checker.status_constructor());
    registry.register_check_constructor("http_content", checker.content_constructor());
    registry.register_sink_constructor("network", Box::new(NetworkSink::from_args));
    registry
}

#[tokio::test]
async fn http_check_results_reach_the_network_sink() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let (capture_addr, batches) = start_capture_server().await;

    let config_json = format!(
        r#"{{
            "checks": [
                {{
                    "name": "web-home",
                    "type": "http",
                    "args": {{ "url": "{}" }},
                    "interval": 60,
                    "sinks": [
                        {{ "network": {{ "address": "{capture_addr}", "flushInterval": "10", "flushCount": "1" }} }}
                    ]
                }}
            ]
        }}"#,
        server.uri()
    );
    let config: Config = serde_json::from_str(&config_json).unwrap();

    let checker = Arc::new(HttpChecker::new(Duration::from_secs(2)));
    let mut registry = registry_with_http(&checker);
    registry.register_from_definitions(&config.checks);
    assert_eq!(registry.tasks().len(), 1);

    let registry = Arc::new(registry);
    let runner = Arc::clone(&registry);
    let handle = tokio::spawn(async move { runner.start_running().await });

    // first iteration fires immediately; flushCount=1 writes right away
    tokio::time::sleep(Duration::from_millis(500)).await;
    registry.stop_running();
    // loops only observe the stop at their next (60s) tick
    handle.abort();

    let batches = batches.lock().await;
    assert_eq!(batches.len(), 1);
    let line = &batches[0];
    assert!(
        line.starts_with("healthcheck,name=web-home,type=http result=0i,duration="),
        "unexpected line: {line}"
    );
}

#[tokio::test]
async fn shared_sink_id_spans_definitions() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let (capture_addr, _batches) = start_capture_server().await;

    let config_json = format!(
        r#"{{
            "checks": [
                {{
                    "name": "first",
                    "type": "http",
                    "args": {{ "url": "{url}" }},
                    "interval": 60,
                    "sinks": [
                        {{ "network": {{ "id": "shared", "address": "{capture_addr}", "flushInterval": "10", "flushCount": "1" }} }}
                    ]
                }},
                {{
                    "name": "second",
                    "type": "http",
                    "args": {{ "url": "{url}" }},
                    "interval": 60,
                    "sinks": [
                        {{ "network": {{ "id": "shared" }} }}
                    ]
                }}
            ]
        }}"#,
        url = server.uri()
    );
    let config: Config = serde_json::from_str(&config_json).unwrap();

    let checker = Arc::new(HttpChecker::new(Duration::from_secs(2)));
    let mut registry = registry_with_http(&checker);
    registry.register_from_definitions(&config.checks);

    // the second reference carries no construction args at all; it can only
    // work through the cache, and both land on one instance
    assert_eq!(registry.tasks().len(), 2);
    assert_eq!(registry.cached_sinks(), 1);
}

#[tokio::test]
async fn definitions_with_unresolvable_parts_are_skipped() {
    let config_json = r#"{
        "checks": [
            { "name": "no such check", "type": "tcp", "interval": 60 },
            {
                "name": "no such sink",
                "type": "http",
                "args": { "url": "http://example.com/" },
                "interval": 60,
                "sinks": [ { "syslog": {} } ]
            },
            {
                "name": "survivor",
                "type": "http",
                "args": { "url": "http://example.com/" },
                "interval": 60
            }
        ]
    }"#;
    let config: Config = serde_json::from_str(config_json).unwrap();

    let checker = Arc::new(HttpChecker::new(Duration::from_secs(2)));
    let mut registry = registry_with_http(&checker);
    registry.register_from_definitions(&config.checks);

    assert_eq!(registry.tasks().len(), 1);
    assert_eq!(registry.tasks()[0].name, "survivor");
}

#[tokio::test]
async fn fan_out_delivers_one_result_to_every_sink() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let sink_a = RecordingSink::new();
    let sink_b = RecordingSink::new();

    let checker = Arc::new(HttpChecker::new(Duration::from_secs(2)));
    let mut registry = registry_with_http(&checker);
    registry
        .add_check(
            "fanout",
            "http",
            &std::collections::HashMap::from([("url".to_string(), server.uri())]),
            Duration::from_secs(60),
            vec![
                Arc::clone(&sink_a) as Arc<dyn healthwatch::sinks::Emitter>,
                Arc::clone(&sink_b) as Arc<dyn healthwatch::sinks::Emitter>,
            ],
        )
        .unwrap();

    let registry = Arc::new(registry);
    let runner = Arc::clone(&registry);
    let handle = tokio::spawn(async move { runner.start_running().await });

    tokio::time::sleep(Duration::from_millis(500)).await;
    registry.stop_running();
    handle.abort();

    let from_a = sink_a.emitted().await;
    let from_b = sink_b.emitted().await;
    assert_eq!(from_a.len(), 1);
    assert_eq!(from_a, from_b);
}
