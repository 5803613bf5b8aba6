//! 端点构建、编码和路径测试

use flare_service_pool::discovery::backend::{node_path, parse_node_path, service_prefix};
use flare_service_pool::{EndPointError, EndPointKey, ServiceEndPoint};
use serde_json::{json, Map, Value};

#[test]
fn test_builder_requires_type_and_id() {
    let err = ServiceEndPoint::builder().id("host-1").build().unwrap_err();
    assert_eq!(err, EndPointError::MissingField("service_type"));

    let err = ServiceEndPoint::builder()
        .service_type("calculator")
        .build()
        .unwrap_err();
    assert_eq!(err, EndPointError::MissingField("id"));

    let err = ServiceEndPoint::builder()
        .service_type("calculator")
        .id("")
        .build()
        .unwrap_err();
    assert_eq!(err, EndPointError::MissingField("id"));
}

#[test]
fn test_builder_rejects_url_unsafe_characters() {
    let err = ServiceEndPoint::builder()
        .service_type("calc ulator")
        .id("host-1")
        .build()
        .unwrap_err();
    assert!(matches!(
        err,
        EndPointError::InvalidCharacters { field: "service_type", .. }
    ));

    let err = ServiceEndPoint::builder()
        .ensemble_name("prod/eu")
        .service_type("calculator")
        .id("host-1")
        .build()
        .unwrap_err();
    assert!(matches!(err, EndPointError::InvalidCharacters { field: "ensemble", .. }));

    // 端口号中的冒号是合法的
    let ep = ServiceEndPoint::builder()
        .ensemble_name("prod")
        .service_type("image-server_v1.2")
        .id("10.0.0.1:8080")
        .payload("{any text / is fine}")
        .build()
        .unwrap();
    assert_eq!(ep.id(), "10.0.0.1:8080");
    assert_eq!(ep.payload(), Some("{any text / is fine}"));
}

#[test]
fn test_json_writes_nulls_for_absent_fields() {
    let ep = ServiceEndPoint::builder()
        .service_type("calculator")
        .id("host-1")
        .build()
        .unwrap();
    let value: Value = serde_json::from_str(&ep.to_json()).unwrap();
    assert_eq!(
        value,
        json!({"ensemble": null, "name": "calculator", "id": "host-1", "payload": null})
    );
}

#[test]
fn test_json_decode_ignores_unknown_fields() {
    let ep = ServiceEndPoint::from_json(
        r#"{"registration-time": "2024-01-01T00:00:00Z", "ensemble": "prod",
            "name": "calculator", "id": "host-1", "payload": "{\"port\": 8080}", "weight": 3}"#,
    )
    .unwrap();
    assert_eq!(ep.ensemble_name(), Some("prod"));
    assert_eq!(ep.service_type(), "calculator");
    assert_eq!(ep.id(), "host-1");
    assert_eq!(ep.payload(), Some("{\"port\": 8080}"));

    let ep = ServiceEndPoint::from_json(r#"{"name": "calculator", "id": "host-2"}"#).unwrap();
    assert_eq!(ep.ensemble_name(), None);
    assert_eq!(ep.payload(), None);
}

#[test]
fn test_json_decode_errors() {
    assert!(matches!(
        ServiceEndPoint::from_json("not json"),
        Err(EndPointError::Json(_))
    ));
    assert_eq!(
        ServiceEndPoint::from_json(r#"{"id": "host-1"}"#).unwrap_err(),
        EndPointError::MissingField("name")
    );
    assert!(matches!(
        ServiceEndPoint::from_json(r#"{"name": "bad name", "id": "host-1"}"#),
        Err(EndPointError::InvalidCharacters { .. })
    ));
}

#[test]
fn test_extras_do_not_override_schema_fields() {
    let ep = ServiceEndPoint::builder()
        .service_type("calculator")
        .id("host-1")
        .build()
        .unwrap();
    let mut extras = Map::new();
    extras.insert("registration-time".to_string(), json!("2024-01-01T00:00:00Z"));
    extras.insert("id".to_string(), json!("spoofed"));

    let encoded = ep.to_json_with_extras(extras);
    let value: Value = serde_json::from_str(&encoded).unwrap();
    assert_eq!(value["registration-time"], "2024-01-01T00:00:00Z");
    assert_eq!(value["id"], "host-1");
    assert_eq!(ServiceEndPoint::from_json(&encoded).unwrap(), ep);
}

#[test]
fn test_equality_covers_payload_but_key_does_not() {
    let a = ServiceEndPoint::builder()
        .service_type("calculator")
        .id("host-1")
        .payload("v1")
        .build()
        .unwrap();
    let b = ServiceEndPoint::builder()
        .service_type("calculator")
        .id("host-1")
        .payload("v2")
        .build()
        .unwrap();
    assert_ne!(a, b);
    assert_eq!(a.key(), b.key());
    assert_eq!(a.key().to_string(), "-/calculator/host-1");
}

#[test]
fn test_node_paths() {
    let key = EndPointKey::new(Some("prod".to_string()), "calculator", "host-1");
    let path = node_path("flare", &key);
    assert_eq!(path, "/flare/services/calculator/prod/host-1");
    assert!(path.starts_with(&service_prefix("flare", Some("prod"), "calculator")));
    assert_eq!(parse_node_path("flare", &path), Some(key));

    let key = EndPointKey::new(None, "calculator", "host-2");
    let path = node_path("flare", &key);
    assert_eq!(path, "/flare/services/calculator/~/host-2");
    assert_eq!(parse_node_path("flare", &path), Some(key));

    assert_eq!(parse_node_path("other", &path), None);
    assert_eq!(parse_node_path("flare", "/flare/services/calculator"), None);
}
