use std::time::{Duration, Instant};

use alloy::primitives::{Address, B256};
use serde_json::json;
use wiremock::matchers::{body_string_contains, method};
use wiremock::{Mock, MockServer, ResponseTemplate};

use tokenscan_indexer::indexer::receipt_fetcher::{self, BLOCK_RECEIPTS_METHOD, TX_RECEIPT_METHOD};
use tokenscan_indexer::rpc::{EndpointHealth, ErrorClass, RpcClient, RpcClientOptions, RpcError};

fn client(server: &MockServer) -> RpcClient {
    RpcClient::new(server.uri(), RpcClientOptions::default()).unwrap()
}

fn rpc_error(code: i64, message: &str) -> serde_json::Value {
    json!({
        "jsonrpc": "2.0",
        "id": 1,
        "error": { "code": code, "message": message }
    })
}

fn rpc_result(result: serde_json::Value) -> serde_json::Value {
    json!({ "jsonrpc": "2.0", "id": 1, "result": result })
}

#[tokio::test]
async fn test_block_number_parses_quantity() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_string_contains("eth_blockNumber"))
        .respond_with(ResponseTemplate::new(200).set_body_json(rpc_result(json!("0x12d687"))))
        .mount(&server)
        .await;

    let latest = client(&server).block_number().await.unwrap();
    assert_eq!(latest, 1_234_567);
}

#[tokio::test]
async fn test_block_number_invalid_hex_demotes_endpoint() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_string_contains("eth_blockNumber"))
        .respond_with(ResponseTemplate::new(200).set_body_json(rpc_result(json!("0xzz"))))
        .mount(&server)
        .await;

    let err = client(&server).block_number().await.unwrap_err();
    assert!(matches!(err, RpcError::InvalidHex { field: "result", .. }));
    assert_eq!(err.class(), ErrorClass::Endpoint(EndpointHealth::InvalidHex));
}

#[tokio::test]
async fn test_http_401_is_unauthorized() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid api key"))
        .mount(&server)
        .await;

    let err = client(&server).block_number().await.unwrap_err();
    match &err {
        RpcError::Unauthorized { method, status } => {
            assert_eq!(*method, "eth_blockNumber");
            assert_eq!(*status, 401);
        }
        other => panic!("expected unauthorized, got {other:?}"),
    }
    assert_eq!(err.class(), ErrorClass::Endpoint(EndpointHealth::Unauthorized));
}

#[tokio::test]
async fn test_http_429_honours_retry_after() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "3"))
        .mount(&server)
        .await;

    let err = client(&server).block_number().await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::RateLimited(Duration::from_secs(3)));
}

#[tokio::test]
async fn test_http_429_without_header_uses_fallback() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;

    let options = RpcClientOptions {
        rate_limit_fallback: Duration::from_millis(2500),
        ..Default::default()
    };
    let rpc = RpcClient::new(server.uri(), options).unwrap();
    let err = rpc.block_number().await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::RateLimited(Duration::from_millis(2500)));
}

#[tokio::test]
async fn test_retry_after_is_clamped_to_one_second() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).insert_header("Retry-After", "0"))
        .mount(&server)
        .await;

    let err = client(&server).block_number().await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::RateLimited(Duration::from_secs(1)));
}

#[tokio::test]
async fn test_vendor_throttle_code_is_rate_limited() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(rpc_error(-32005, "request rate exceeded")),
        )
        .mount(&server)
        .await;

    let err = client(&server).block_number().await.unwrap_err();
    assert!(matches!(err, RpcError::RateLimited { .. }));
}

#[tokio::test]
async fn test_get_logs_range_too_large() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_string_contains("eth_getLogs"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(rpc_error(-32062, "block range is too large, max 1000")),
        )
        .mount(&server)
        .await;

    let err = client(&server)
        .get_logs_range(100, 5_000, None, None)
        .await
        .unwrap_err();
    assert_eq!(err.class(), ErrorClass::RangeTooLarge);
}

#[tokio::test]
async fn test_get_logs_sends_scoped_filter() {
    let server = MockServer::start().await;
    let token = Address::repeat_byte(0xab);
    Mock::given(method("POST"))
        .and(body_string_contains("eth_getLogs"))
        .and(body_string_contains("0xabababababababababababababababababababab"))
        .and(body_string_contains("\"fromBlock\":\"0x64\""))
        .respond_with(ResponseTemplate::new(200).set_body_json(rpc_result(json!([]))))
        .expect(1)
        .mount(&server)
        .await;

    let logs = client(&server)
        .get_logs_range(100, 200, Some(token), None)
        .await
        .unwrap();
    assert!(logs.is_empty());
}

#[tokio::test]
async fn test_generic_rpc_error_is_other() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(rpc_error(-32000, "header not found")),
        )
        .mount(&server)
        .await;

    let err = client(&server).block_number().await.unwrap_err();
    match &err {
        RpcError::Rpc { code, message, .. } => {
            assert_eq!(*code, -32000);
            assert_eq!(message, "header not found");
        }
        other => panic!("expected rpc error, got {other:?}"),
    }
    assert_eq!(err.class(), ErrorClass::Other);
}

#[tokio::test]
async fn test_block_receipts_method_not_found_is_remembered() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_string_contains("eth_getBlockReceipts"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(rpc_error(-32601, "the method does not exist")),
        )
        .expect(1)
        .mount(&server)
        .await;

    let rpc = client(&server);
    let hash = B256::repeat_byte(0x11);

    assert!(rpc.get_block_receipts(hash).await.unwrap().is_none());
    assert!(rpc.block_receipts_unsupported());
    // Second call short-circuits without touching the endpoint.
    assert!(rpc.get_block_receipts(hash).await.unwrap().is_none());
}

#[tokio::test]
async fn test_receipts_fall_back_to_per_transaction() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_string_contains("eth_getBlockReceipts"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(rpc_error(-32601, "method not found")),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_string_contains("eth_getTransactionReceipt"))
        .respond_with(ResponseTemplate::new(200).set_body_json(rpc_result(json!({
            "transactionHash": format!("{:#x}", B256::repeat_byte(0x22)),
            "transactionIndex": "0x0",
            "blockNumber": "0x10",
            "blockHash": format!("{:#x}", B256::repeat_byte(0x11)),
            "status": "0x1",
            "gasUsed": "0x5208",
            "cumulativeGasUsed": "0x5208",
            "logs": []
        }))))
        .expect(2)
        .mount(&server)
        .await;

    let rpc = client(&server);
    let fetched = receipt_fetcher::fetch_block_receipts(
        &rpc,
        B256::repeat_byte(0x11),
        &[B256::repeat_byte(0x22), B256::repeat_byte(0x33)],
    )
    .await
    .unwrap();

    assert_eq!(fetched.method, TX_RECEIPT_METHOD);
    assert_eq!(fetched.receipts.len(), 2);
}

#[tokio::test]
async fn test_block_receipts_used_when_supported() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_string_contains("eth_getBlockReceipts"))
        .respond_with(ResponseTemplate::new(200).set_body_json(rpc_result(json!([{
            "transactionHash": format!("{:#x}", B256::repeat_byte(0x22)),
            "transactionIndex": "0x0",
            "blockNumber": "0x10",
            "status": "0x1",
            "gasUsed": "0x5208",
            "cumulativeGasUsed": "0x5208",
            "logs": []
        }]))))
        .expect(1)
        .mount(&server)
        .await;

    let rpc = client(&server);
    let fetched = receipt_fetcher::fetch_block_receipts(
        &rpc,
        B256::repeat_byte(0x11),
        &[B256::repeat_byte(0x22)],
    )
    .await
    .unwrap();

    assert_eq!(fetched.method, BLOCK_RECEIPTS_METHOD);
    assert_eq!(fetched.receipts.len(), 1);
}

#[tokio::test]
async fn test_qps_paces_requests() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(rpc_result(json!("0x1"))))
        .mount(&server)
        .await;

    let options = RpcClientOptions {
        qps: Some(10.0),
        ..Default::default()
    };
    let rpc = RpcClient::new(server.uri(), options).unwrap();

    let started = Instant::now();
    for _ in 0..3 {
        rpc.block_number().await.unwrap();
    }
    // First call goes out immediately, the next two wait 100ms each.
    assert!(started.elapsed() >= Duration::from_millis(190));
}
