mod support;

use api_contract::BrowseNodesRequest;
use gw_chunked::{
    BulkFetch, BulkFetchError, ChunkedCallClient, ItemSink, JsonArrayWriter, decompress_json,
};
use gw_transport::MethodResult;
use serde_json::{Value, json};
use std::sync::Arc;
use support::{ScriptedInvoker, accepted, completed};

fn browse_request() -> BrowseNodesRequest {
    BrowseNodesRequest {
        opc_endpoint: None,
        start_node: "ns=0;i=85".to_string(),
        depth: 5,
        requested_node_classes: vec![1, 2],
        requested_attributes: vec![2, 3, 4, 5, 14],
    }
}

fn node(id: u32) -> Value {
    json!({ "nodeId": format!("ns=2;i={}", id) })
}

#[tokio::test(start_paused = true)]
async fn drains_all_pages_into_one_array() {
    let invoker = Arc::new(ScriptedInvoker::new(vec![
        accepted("start"),
        completed(&json!({ "JobId": "job-7" })),
        accepted("p1"),
        completed(&json!({ "nodes": [node(1), node(2), node(3)], "continuationToken": "abc" })),
        accepted("p2"),
        completed(&json!({ "nodes": [node(4), node(5)] })),
    ]));
    let fetch = BulkFetch::new(ChunkedCallClient::new(invoker.clone(), "opcpublisher"));

    let mut job = fetch.start(&browse_request()).await.expect("started");
    assert_eq!(job.job_id, "job-7");

    let mut sink = JsonArrayWriter::new(Vec::new());
    let summary = fetch.drain(&mut job, &mut sink).await.expect("drained");

    assert_eq!(summary.page_count, 2);
    assert_eq!(summary.item_count, 5);
    let items: Vec<Value> = serde_json::from_slice(&sink.into_inner()).unwrap();
    assert_eq!(items.len(), 5);
    assert_eq!(items[4]["nodeId"], "ns=2;i=5");

    let requests = invoker.requests.lock().unwrap();
    let page_methods: Vec<&str> = requests
        .iter()
        .map(|(_, request)| request.method_name.as_str())
        .collect();
    assert_eq!(
        page_methods,
        vec![
            "BrowseNodes_v1",
            "BrowseNodes_v1",
            "FetchBrowsedNodes_v1",
            "FetchBrowsedNodes_v1",
            "FetchBrowsedNodes_v1",
            "FetchBrowsedNodes_v1",
        ]
    );

    // 首页使用令牌 "1"，之后转发上一页返回的令牌
    let page_bodies: Vec<Value> = [2, 4]
        .iter()
        .map(|index| {
            let encoded = requests[*index].1.payload["Payload"].as_str().unwrap();
            decompress_json(encoded).unwrap()
        })
        .collect();
    assert_eq!(page_bodies[0], json!({ "JobId": "job-7", "ContinuationToken": "1" }));
    assert_eq!(page_bodies[1], json!({ "JobId": "job-7", "ContinuationToken": "abc" }));
    assert_eq!(requests[3].1.payload["RequestId"], "p1");
    assert_eq!(requests[5].1.payload["RequestId"], "p2");
}

#[tokio::test(start_paused = true)]
async fn mid_fetch_error_still_closes_array() {
    let invoker = Arc::new(ScriptedInvoker::new(vec![
        accepted("p1"),
        completed(&json!({ "nodes": [node(1), node(2)], "continuationToken": "next" })),
        MethodResult::new(500, json!({ "error": { "code": "JobExpired" } })),
    ]));
    let fetch = BulkFetch::new(ChunkedCallClient::new(invoker, "opcpublisher"));
    let mut job = gw_chunked::BulkFetchJob {
        job_id: "job-9".to_string(),
        continuation_token: None,
        page_count: 0,
    };

    let mut sink = JsonArrayWriter::new(Vec::new());
    let err = fetch.drain(&mut job, &mut sink).await.expect_err("aborted");

    assert_eq!(err.to_string(), "JobExpired");
    assert_eq!(job.page_count, 1);
    let items: Vec<Value> = serde_json::from_slice(&sink.into_inner()).unwrap();
    assert_eq!(items.len(), 2);
}

#[tokio::test]
async fn start_without_job_id_fails() {
    let invoker = Arc::new(ScriptedInvoker::new(vec![
        accepted("start"),
        completed(&json!({ "Status": "queued" })),
    ]));
    let fetch = BulkFetch::new(ChunkedCallClient::new(invoker, "opcpublisher"));

    let err = fetch.start(&browse_request()).await.expect_err("no job");
    assert!(matches!(err, BulkFetchError::MissingJobId(_)));
}

#[tokio::test]
async fn empty_writer_produces_empty_array() {
    let mut sink = JsonArrayWriter::new(Vec::new());
    sink.finish().await.unwrap();
    sink.finish().await.unwrap();
    assert_eq!(sink.into_inner(), b"[]".to_vec());
}
