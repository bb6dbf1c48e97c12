use nl2dax::config::PowerBiSettings;
use nl2dax::execution::{PowerBiRestExecutor, QueryExecutor, RetryPolicy, XmlaExecutor};
use nl2dax::PipelineError;
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn settings(endpoint: &str) -> PowerBiSettings {
    PowerBiSettings {
        tenant_id: "tenant-1".to_string(),
        client_id: "client".to_string(),
        client_secret: "secret".to_string(),
        endpoint: endpoint.to_string(),
        dataset_name: "Banking Model".to_string(),
        dataset_id: None,
    }
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(3, Duration::from_millis(1))
}

async fn mount_token(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/tenant-1/oauth2/v2.0/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "token-abc",
            "expires_in": 3600
        })))
        .expect(1)
        .mount(server)
        .await;
}

async fn mount_catalog(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/groups"))
        .and(header("authorization", "Bearer token-abc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [{"id": "g-1", "name": "Finance Workspace"}]
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/groups/g-1/datasets"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [{"id": "d-9", "name": "banking model"}]
        })))
        .mount(server)
        .await;
}

fn rest_executor(server: &MockServer) -> PowerBiRestExecutor {
    PowerBiRestExecutor::new(
        &settings("powerbi://api.powerbi.com/v1.0/myorg/Finance%20Workspace"),
        fast_retry(),
    )
    .unwrap()
    .with_api_base(server.uri())
    .with_authority(server.uri())
}

#[tokio::test]
async fn test_rest_execute_queries() {
    let server = MockServer::start().await;
    mount_token(&server).await;
    mount_catalog(&server).await;
    Mock::given(method("POST"))
        .and(path("/groups/g-1/datasets/d-9/executeQueries"))
        .and(body_string_contains("EVALUATE 'DIM_CUSTOMER'"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [{"tables": [{"rows": [
                {"DIM_CUSTOMER[CUSTOMER_NAME]": "Acme", "[Total]": 10.5},
                {"DIM_CUSTOMER[CUSTOMER_NAME]": "Globex", "[Total]": null}
            ]}]}]
        })))
        .mount(&server)
        .await;

    let executor = rest_executor(&server);
    assert_eq!(executor.workspace_name(), "Finance Workspace");

    let result = executor.execute("EVALUATE 'DIM_CUSTOMER'").await.unwrap();
    assert!(result.success);
    assert_eq!(result.engine, "powerbi-rest");
    assert_eq!(result.columns, vec!["CUSTOMER_NAME", "Total"]);
    assert_eq!(result.row_count, 2);
    assert_eq!(result.rows[0]["CUSTOMER_NAME"], json!("Acme"));

    // ids and token are reused
    assert!(executor.health_check().await.unwrap());
    assert_eq!(executor.resolve().await.unwrap(), ("g-1".to_string(), "d-9".to_string()));
}

#[tokio::test]
async fn test_rest_retries_throttling() {
    let server = MockServer::start().await;
    mount_token(&server).await;
    mount_catalog(&server).await;
    Mock::given(method("POST"))
        .and(path("/groups/g-1/datasets/d-9/executeQueries"))
        .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/groups/g-1/datasets/d-9/executeQueries"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [{"tables": [{"rows": [{"[n]": 1}]}]}]
        })))
        .mount(&server)
        .await;

    let result = rest_executor(&server).execute("EVALUATE ROW(\"n\", 1)").await.unwrap();
    assert_eq!(result.rows[0]["n"], json!(1));
}

#[tokio::test]
async fn test_rest_bad_request_is_not_retried() {
    let server = MockServer::start().await;
    mount_token(&server).await;
    mount_catalog(&server).await;
    Mock::given(method("POST"))
        .and(path("/groups/g-1/datasets/d-9/executeQueries"))
        .respond_with(ResponseTemplate::new(400).set_body_string("{\"error\": {\"code\": \"DatasetExecuteQueriesError\"}}"))
        .expect(1)
        .mount(&server)
        .await;

    let err = rest_executor(&server).execute("EVALUATE x").await.unwrap_err();
    match err {
        PipelineError::PowerBi { status, .. } => assert_eq!(status, Some(400)),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_rest_unknown_workspace() {
    let server = MockServer::start().await;
    mount_token(&server).await;
    Mock::given(method("GET"))
        .and(path("/groups"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"value": [{"id": "g-2", "name": "Sales"}]})))
        .mount(&server)
        .await;

    let err = rest_executor(&server).health_check().await.unwrap_err();
    assert!(err.to_string().contains("Workspace 'Finance Workspace' not found. Available: Sales"));
}

const XMLA_ROWS: &str = r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">
  <soap:Body>
    <ExecuteResponse xmlns="urn:schemas-microsoft-com:xml-analysis">
      <return>
        <root xmlns="urn:schemas-microsoft-com:xml-analysis:rowset"
              xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance">
          <row><SEGMENT xsi:type="xsd:string">Retail</SEGMENT><CNT xsi:type="xsd:long">4</CNT></row>
        </root>
      </return>
    </ExecuteResponse>
  </soap:Body>
</soap:Envelope>"#;

const XMLA_FAULT: &str = r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">
  <soap:Body>
    <soap:Fault>
      <faultcode>XMLAnalysisError.0xc10a0004</faultcode>
      <faultstring>Query (1, 10) The syntax for 'FROM' is incorrect.</faultstring>
    </soap:Fault>
  </soap:Body>
</soap:Envelope>"#;

#[tokio::test]
async fn test_xmla_execute_and_fault() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/tenant-1/oauth2/v2.0/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"access_token": "token-abc", "expires_in": 3600})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/xmla"))
        .and(header("SOAPAction", "urn:schemas-microsoft-com:xml-analysis:Execute"))
        .and(body_string_contains("<Catalog>Banking Model</Catalog>"))
        .and(body_string_contains("SUMMARIZE"))
        .respond_with(ResponseTemplate::new(200).set_body_string(XMLA_ROWS))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/xmla"))
        .and(body_string_contains("FROM"))
        .respond_with(ResponseTemplate::new(500).set_body_string(XMLA_FAULT))
        .mount(&server)
        .await;

    let executor = XmlaExecutor::new(&settings(&format!("{}/xmla", server.uri())), fast_retry())
        .unwrap()
        .with_authority(server.uri());

    let result = executor
        .execute("EVALUATE SUMMARIZE('DIM_CUSTOMER', 'DIM_CUSTOMER'[SEGMENT])")
        .await
        .unwrap();
    assert_eq!(result.engine, "xmla");
    assert_eq!(result.columns, vec!["SEGMENT", "CNT"]);
    assert_eq!(result.rows[0]["CNT"], json!(4));

    let err = executor.execute("SELECT * FROM x").await.unwrap_err();
    assert!(err
        .to_string()
        .contains("XMLAnalysisError.0xc10a0004: Query (1, 10) The syntax for 'FROM' is incorrect."));
}
