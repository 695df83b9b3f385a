//! HTTP API endpoint tests
//!
//! These exercise the real router returned by `tileserver_rs::app::build_router`
//! through `axum_test::TestServer`, covering status codes, headers, and payload
//! shapes for every route the server exposes.

mod test_support;

use axum_test::TestServer;
use serde_json::json;
use test_support::{raster_datasource, spawn_test_app};

#[tokio::test]
async fn health_reports_running() {
    let (_guard, state) = spawn_test_app();
    let server = TestServer::new(tileserver_rs::app::build_router(state, &[])).unwrap();

    let resp = server.get("/api/health").await;
    resp.assert_status_ok();
    let body: serde_json::Value = resp.json();
    assert_eq!(body["worker_status"], "running");
    assert_eq!(body["worker_type"], "tokio");
}

#[tokio::test]
async fn openapi_json_lists_every_route() {
    let (_guard, state) = spawn_test_app();
    let server = TestServer::new(tileserver_rs::app::build_router(state, &[])).unwrap();

    let resp = server.get("/api/openapi.json").await;
    resp.assert_status_ok();
    let spec: serde_json::Value = resp.json();
    let paths = spec["paths"].as_object().expect("paths object");
    for path in [
        "/api/health",
        "/api/tile/{datasource}/{z}/{x}/{y}.{ext}",
        "/api/pyramid",
        "/api/datasources",
        "/api/datasources/{id}",
        "/api/datasources/load_files",
    ] {
        assert!(paths.contains_key(path), "missing documented path: {path}");
    }
}

#[tokio::test]
async fn swagger_ui_serves_html() {
    let (_guard, state) = spawn_test_app();
    let server = TestServer::new(tileserver_rs::app::build_router(state, &[])).unwrap();

    let resp = server.get("/api/docs").await;
    resp.assert_status_ok();
    let body = resp.text();
    assert!(body.contains("swagger-ui"));
}

#[tokio::test]
async fn datasource_crud_round_trip() {
    let (_guard, state) = spawn_test_app();
    let server = TestServer::new(tileserver_rs::app::build_router(state, &[])).unwrap();

    let ds = raster_datasource("crud-test");
    let created = server.post("/api/datasources").json(&ds).await;
    created.assert_status_ok();
    assert_eq!(created.json::<serde_json::Value>()["message"], "created");

    let listed = server.get("/api/datasources").await;
    listed.assert_status_ok();
    let all: Vec<serde_json::Value> = listed.json();
    assert!(all.iter().any(|d| d["id"] == "crud-test"));

    let fetched = server.get("/api/datasources/crud-test").await;
    fetched.assert_status_ok();
    assert_eq!(fetched.json::<serde_json::Value>()["id"], "crud-test");

    let replaced = server.put("/api/datasources").json(&ds).await;
    replaced.assert_status_ok();
    assert_eq!(replaced.json::<serde_json::Value>()["message"], "replaced");

    let deleted = server
        .delete("/api/datasources")
        .json(&json!({ "id": "crud-test" }))
        .await;
    deleted.assert_status_ok();

    let missing = server.get("/api/datasources/crud-test").await;
    missing.assert_status_not_found();
}

#[tokio::test]
async fn upsert_rejects_invalid_zoom_range() {
    let (_guard, state) = spawn_test_app();
    let server = TestServer::new(tileserver_rs::app::build_router(state, &[])).unwrap();

    let mut ds = raster_datasource("bad-zoom");
    ds["minzoom"] = json!(10);
    ds["maxzoom"] = json!(2);

    let resp = server.post("/api/datasources").json(&ds).await;
    resp.assert_status_bad_request();
}

#[tokio::test]
async fn get_unknown_datasource_is_not_found() {
    let (_guard, state) = spawn_test_app();
    let server = TestServer::new(tileserver_rs::app::build_router(state, &[])).unwrap();

    let resp = server.get("/api/datasources/does-not-exist").await;
    resp.assert_status_not_found();
}

#[tokio::test]
async fn tile_request_rejects_malformed_suffix() {
    let (_guard, state) = spawn_test_app();
    let server = TestServer::new(tileserver_rs::app::build_router(state, &[])).unwrap();

    let resp = server.get("/api/tile/anything/0/0/not-a-number").await;
    resp.assert_status_bad_request();
}

#[tokio::test]
async fn tile_request_against_unknown_datasource_is_not_found() {
    let (_guard, state) = spawn_test_app();
    let server = TestServer::new(tileserver_rs::app::build_router(state, &[])).unwrap();

    let resp = server.get("/api/tile/does-not-exist/0/0/0.png").await;
    resp.assert_status_not_found();
}

#[tokio::test]
async fn vector_tile_without_postgres_pool_returns_no_content() {
    let (_guard, state) = spawn_test_app();
    let server = TestServer::new(tileserver_rs::app::build_router(state, &[])).unwrap();

    let mut ds = raster_datasource("vector-test");
    ds["kind"] = json!("vector");
    ds["data_store"] = json!({ "type": "external_template", "url_template": "https://example.invalid/{z}/{x}/{y}.pbf" });
    server.post("/api/datasources").json(&ds).await.assert_status_ok();

    let resp = server.get("/api/tile/vector-test/0/0/0.pbf").await;
    resp.assert_status(axum::http::StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn cors_permissive_wildcard_echoes_origin() {
    let (_guard, state) = spawn_test_app();
    let router = tileserver_rs::app::build_router(state, &["*".to_string()]);
    let server = TestServer::new(router).unwrap();

    let resp = server
        .get("/api/health")
        .add_header(axum::http::header::ORIGIN, "https://example.org")
        .await;
    resp.assert_status_ok();
    assert!(resp.headers().get("access-control-allow-origin").is_some());
}
