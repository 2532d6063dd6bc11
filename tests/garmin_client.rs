use peloton_sync::garmin_client::{ActivityUploader, GarminClient, UploadError};
use serde_json::json;
use std::path::PathBuf;
use tempdir::TempDir;
use wiremock::matchers::{
    body_partial_json, body_string_contains, header, method, path, query_param,
};
use wiremock::{Mock, MockServer, ResponseTemplate};

const LOGIN_PAGE: &str = r#"<form method="post">
<input type="hidden" name="_csrf" value="csrf-token-1" />
</form>"#;

const TICKET_PAGE: &str = r#"<script>
var response_url = "https://connect.garmin.com/modern?ticket=ST-0123-abcDEF-cas";
</script>"#;

async fn mount_sign_in(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/sso/signin"))
        .and(query_param("service", format!("{}/modern", server.uri())))
        .and(query_param("clientId", "GarminConnect"))
        .respond_with(ResponseTemplate::new(200).set_body_string(LOGIN_PAGE))
        .expect(1)
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/sso/signin"))
        .and(body_string_contains("_csrf=csrf-token-1"))
        .and(body_string_contains("username=rider%40example.com"))
        .respond_with(ResponseTemplate::new(200).set_body_string(TICKET_PAGE))
        .expect(1)
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/modern"))
        .and(query_param("ticket", "ST-0123-abcDEF-cas"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(server)
        .await;
}

fn client(server: &MockServer) -> GarminClient {
    GarminClient::with_urls(&server.uri(), &server.uri(), "rider@example.com", "hunter2").unwrap()
}

fn activity_file(dir: &TempDir, name: &str) -> PathBuf {
    let file = dir.path().join(name);
    std::fs::write(&file, "<TrainingCenterDatabase/>").unwrap();
    file
}

#[tokio::test]
async fn test_upload_signs_in_once_and_renames_activity() {
    let server = MockServer::start().await;
    mount_sign_in(&server).await;

    Mock::given(method("POST"))
        .and(path("/modern/proxy/upload-service/upload/.tcx"))
        .and(header("NK", "NT"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "detailedImportResult": {
                "successes": [{ "internalId": 987 }],
                "failures": []
            }
        })))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/modern/proxy/activity-service/activity/987"))
        .and(body_partial_json(json!({
            "activityName": "30 min Climb Ride with Denis Morton",
            "activityTypeDTO": { "typeKey": "cycling" }
        })))
        .respond_with(ResponseTemplate::new(204))
        .expect(2)
        .mount(&server)
        .await;

    let dir = TempDir::new("garmin_client").unwrap();
    let first = activity_file(&dir, "first.tcx");
    let second = activity_file(&dir, "second.tcx");
    let client = client(&server);

    client
        .upload(&[first], "cycling", "30 min Climb Ride with Denis Morton")
        .await
        .unwrap();
    client
        .upload(&[second], "cycling", "30 min Climb Ride with Denis Morton")
        .await
        .unwrap();
}

#[tokio::test]
async fn test_failed_rename_still_counts_as_uploaded() {
    let server = MockServer::start().await;
    mount_sign_in(&server).await;

    Mock::given(method("POST"))
        .and(path("/modern/proxy/upload-service/upload/.tcx"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "detailedImportResult": { "successes": [{ "internalId": 55 }] }
        })))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/modern/proxy/activity-service/activity/55"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let dir = TempDir::new("garmin_client").unwrap();
    let file = activity_file(&dir, "ride.tcx");

    let result = client(&server).upload(&[file], "cycling", "Ride").await;

    assert!(result.is_ok());
}

#[tokio::test]
async fn test_duplicate_upload_is_rejected() {
    let server = MockServer::start().await;
    mount_sign_in(&server).await;

    Mock::given(method("POST"))
        .and(path("/modern/proxy/upload-service/upload/.tcx"))
        .respond_with(ResponseTemplate::new(409))
        .mount(&server)
        .await;

    let dir = TempDir::new("garmin_client").unwrap();
    let file = activity_file(&dir, "ride.tcx");

    let result = client(&server).upload(&[file], "cycling", "Ride").await;

    assert!(matches!(result, Err(UploadError::Rejected(_))));
}

#[tokio::test]
async fn test_import_failure_is_rejected_with_message() {
    let server = MockServer::start().await;
    mount_sign_in(&server).await;

    Mock::given(method("POST"))
        .and(path("/modern/proxy/upload-service/upload/.tcx"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "detailedImportResult": {
                "successes": [],
                "failures": [{ "messages": [{ "content": "Unsupported file" }] }]
            }
        })))
        .mount(&server)
        .await;

    let dir = TempDir::new("garmin_client").unwrap();
    let file = activity_file(&dir, "ride.tcx");

    let result = client(&server).upload(&[file], "cycling", "Ride").await;

    match result {
        Err(UploadError::Rejected(message)) => assert_eq!(message, "Unsupported file"),
        other => panic!("expected rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn test_missing_ticket_is_authentication_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/sso/signin"))
        .respond_with(ResponseTemplate::new(200).set_body_string(LOGIN_PAGE))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/sso/signin"))
        .respond_with(ResponseTemplate::new(200).set_body_string("Invalid sign in"))
        .mount(&server)
        .await;

    let dir = TempDir::new("garmin_client").unwrap();
    let file = activity_file(&dir, "ride.tcx");

    let result = client(&server).upload(&[file], "cycling", "Ride").await;

    assert!(matches!(result, Err(UploadError::Authentication(_))));
    let uploads = server
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .filter(|request| request.url.path().contains("upload-service"))
        .count();
    assert_eq!(uploads, 0);
}

#[tokio::test]
async fn test_failed_sign_in_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/sso/signin"))
        .respond_with(ResponseTemplate::new(200).set_body_string(LOGIN_PAGE))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/sso/signin"))
        .respond_with(ResponseTemplate::new(200).set_body_string("Invalid sign in"))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new("garmin_client").unwrap();
    let first = activity_file(&dir, "first.tcx");
    let second = activity_file(&dir, "second.tcx");
    let client = client(&server);

    let first_result = client.upload(&[first], "cycling", "Ride").await;
    let second_result = client.upload(&[second], "cycling", "Ride").await;

    assert!(matches!(first_result, Err(UploadError::Authentication(_))));
    match second_result {
        Err(UploadError::Authentication(message)) => {
            assert!(message.contains("already failed"))
        }
        other => panic!("expected authentication error, got {other:?}"),
    }
    let sign_in_posts = server
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .filter(|request| request.method.as_str() == "POST")
        .count();
    assert_eq!(sign_in_posts, 1);
}
