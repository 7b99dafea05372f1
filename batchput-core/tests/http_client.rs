use serde_json::json;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use batchput_core::client::HttpStorage;
use batchput_core::contract::{FileQuery, PartRange, StorageApi, UploadEntry, UploadRequest};
use batchput_core::{UploadConfig, UploadError};

fn config(server: &MockServer) -> UploadConfig {
    UploadConfig::new(server.uri(), "secret", "batch-7")
}

fn ok(data: serde_json::Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({ "code": 200, "data": data }))
}

#[tokio::test]
async fn batch_upload_sends_joined_metadata_headers() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/v2/upload"))
        .and(header("authorization", "Bearer secret"))
        .and(header("x-meta-content-batchtoken", "batch-7"))
        .and(header("x-meta-content-index", "3;4"))
        .and(header("x-meta-content-size", "2;1"))
        .and(header("x-meta-content-md5", "aa;bb"))
        .and(header("x-meta-content-name", "a.txt%3Bb%20c.txt"))
        .respond_with(ok(json!({})))
        .expect(1)
        .mount(&server)
        .await;

    let client = HttpStorage::new(&config(&server)).unwrap();
    let envelope = client
        .upload(UploadRequest {
            entries: vec![
                UploadEntry {
                    index: 3,
                    name: "a.txt".into(),
                    size: 2,
                    fingerprint: "aa".into(),
                },
                UploadEntry {
                    index: 4,
                    name: "b c.txt".into(),
                    size: 1,
                    fingerprint: "bb".into(),
                },
            ],
            part: None,
            body: b"xyz".to_vec(),
        })
        .await
        .unwrap();
    assert_eq!(envelope.code, 200);
}

#[tokio::test]
async fn part_upload_carries_byte_range() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/v2/upload"))
        .and(header("x-meta-content-partno", "2"))
        .and(header("ccrange", "bytes=20-40/50"))
        .respond_with(ok(json!(null)))
        .expect(1)
        .mount(&server)
        .await;

    let client = HttpStorage::new(&config(&server)).unwrap();
    client
        .upload(UploadRequest {
            entries: vec![UploadEntry {
                index: 0,
                name: "big.bin".into(),
                size: 50,
                fingerprint: "ff".into(),
            }],
            part: Some(PartRange {
                part_number: 2,
                start: 20,
                end: 40,
                total: 50,
            }),
            body: vec![7; 20],
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn hash_check_accepts_numeric_strings() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v2/upload/checkmd5s"))
        .respond_with(ok(json!({ "failedIds": [1, "5", " 9 "], "needCheck": true })))
        .mount(&server)
        .await;

    let client = HttpStorage::new(&config(&server)).unwrap();
    let check = client.check_hashes().await.unwrap();
    assert_eq!(check.failed.into_iter().collect::<Vec<_>>(), vec![1, 5, 9]);
    assert!(check.need_check);
}

#[tokio::test]
async fn uploaded_check_posts_the_file_list() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v2/upload/checkfiles"))
        .and(body_json(json!({
            "fileList": [
                { "name": "a", "index": 0, "fileSize": 3, "meta": "/d/a", "hash": "h0" }
            ]
        })))
        .respond_with(ok(json!({ "fileIds": ["0"] })))
        .expect(1)
        .mount(&server)
        .await;

    let client = HttpStorage::new(&config(&server)).unwrap();
    let found = client
        .check_uploaded(vec![FileQuery {
            name: "a".into(),
            index: 0,
            file_size: 3,
            meta: "/d/a".into(),
            hash: "h0".into(),
        }])
        .await
        .unwrap();
    assert!(found.contains(&0));
}

#[tokio::test]
async fn non_success_envelope_is_a_transport_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v2/upload/checkmd5s"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "code": 403, "message": "denied" })),
        )
        .mount(&server)
        .await;

    let client = HttpStorage::new(&config(&server)).unwrap();
    match client.check_hashes().await {
        Err(UploadError::Transport { uri, body }) => {
            assert!(uri.ends_with("/v2/upload/checkmd5s"));
            assert!(body.contains("denied"));
        }
        other => panic!("expected transport error, got {other:?}"),
    }
}

#[tokio::test]
async fn unreachable_server_is_a_transport_error() {
    let cfg = UploadConfig {
        timeout_secs: 2,
        ..UploadConfig::new("http://127.0.0.1:9", "secret", "batch-7")
    };
    let client = HttpStorage::new(&cfg).unwrap();
    assert!(matches!(
        client.check_hashes().await,
        Err(UploadError::Transport { .. })
    ));
}
