//! HTTP/2 downstream and upstream paths.

mod common;

use std::time::Duration;

use bytes::Bytes;
use common::*;
use edge_proxy::codec::Protocol;
use http::{HeaderMap, HeaderValue, Method, Request};

async fn read_body(body: &mut h2::RecvStream) -> Vec<u8> {
    let mut out = Vec::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk.unwrap();
        let _ = body.flow_control().release_capacity(chunk.len());
        out.extend_from_slice(&chunk);
    }
    out
}

fn request(method: Method, path: &str) -> Request<()> {
    Request::builder()
        .method(method)
        .uri(format!("http://example.com{path}"))
        .body(())
        .unwrap()
}

#[tokio::test]
async fn h2_round_trip_carries_trailers() {
    let (backend, recorded) = start_h2_echo_backend().await;
    let proxy = start_proxy(single_route_config(Protocol::Http2, Protocol::Http2, &[backend])).await;
    let mut client = h2_client(proxy.addr).await;

    let (response, mut send) = client
        .send_request(request(Method::POST, "/echo"), false)
        .unwrap();
    send.send_data(Bytes::from_static(b"hello"), false).unwrap();
    let mut trailers = HeaderMap::new();
    trailers.insert("x-checksum", HeaderValue::from_static("abc"));
    send.send_trailers(trailers).unwrap();

    let response = response.await.unwrap();
    assert_eq!(response.status(), 200);
    let mut body = response.into_body();
    assert_eq!(read_body(&mut body).await, b"hello");
    let trailers = body.trailers().await.unwrap().expect("response trailers");
    assert_eq!(trailers.get("x-checksum").unwrap(), "abc");

    let recorded = recorded.lock().unwrap().clone();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].path, "/echo");
    assert_eq!(recorded[0].body, b"hello");
    assert_eq!(
        recorded[0].trailers.as_ref().unwrap().get("x-checksum").unwrap(),
        "abc"
    );
}

#[tokio::test]
async fn h2_downstream_to_http1_upstream() {
    let backend = start_mock_backend(response("200 OK", "from http1")).await;
    let proxy = start_proxy(single_route_config(Protocol::Http2, Protocol::Http1, &[backend.addr])).await;
    let mut client = h2_client(proxy.addr).await;

    let (response, _) = client.send_request(request(Method::GET, "/path"), true).unwrap();
    let response = response.await.unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(read_body(&mut response.into_body()).await, b"from http1");
    let recorded = backend.recorded();
    assert_eq!(recorded[0].request_line(), "GET /path HTTP/1.1");
    assert_eq!(recorded[0].header("host").as_deref(), Some("example.com"));
}

#[tokio::test]
async fn http1_downstream_to_h2_upstream() {
    let (backend, recorded) = start_h2_echo_backend().await;
    let proxy = start_proxy(single_route_config(Protocol::Http1, Protocol::Http2, &[backend])).await;

    let resp = reqwest::Client::builder()
        .no_proxy()
        .build()
        .unwrap()
        .post(proxy.url("/upgrade"))
        .body("over h2")
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    assert_eq!(resp.bytes().await.unwrap().as_ref(), b"over h2");
    assert_eq!(recorded.lock().unwrap()[0].path, "/upgrade");
}

#[tokio::test]
async fn concurrent_streams_share_one_connection() {
    let (backend, recorded) = start_h2_echo_backend().await;
    let proxy = start_proxy(single_route_config(Protocol::Http2, Protocol::Http2, &[backend])).await;
    let client = h2_client(proxy.addr).await;

    let mut handles = Vec::new();
    for i in 0..10 {
        let mut client = client.clone().ready().await.unwrap();
        handles.push(tokio::spawn(async move {
            let (response, mut send) = client
                .send_request(request(Method::POST, &format!("/s/{i}")), false)
                .unwrap();
            send.send_data(Bytes::from(format!("body-{i}")), true).unwrap();
            let response = response.await.unwrap();
            let body = read_body(&mut response.into_body()).await;
            (i, body)
        }));
    }

    for handle in handles {
        let (i, body) = handle.await.unwrap();
        assert_eq!(body, format!("body-{i}").into_bytes());
    }
    assert_eq!(recorded.lock().unwrap().len(), 10);
}

#[tokio::test]
async fn h2_connect_failure_is_503() {
    let dead = closed_port().await;
    let proxy = start_proxy(single_route_config(Protocol::Http2, Protocol::Http2, &[dead])).await;
    let mut client = h2_client(proxy.addr).await;

    let (response, _) = client.send_request(request(Method::GET, "/"), true).unwrap();
    let response = response.await.unwrap();

    assert_eq!(response.status(), 503);
    assert_eq!(
        read_body(&mut response.into_body()).await,
        edge_proxy::codec::reply::UPSTREAM_UNAVAILABLE_BODY.as_bytes()
    );
}

#[tokio::test]
async fn client_reset_after_headers_closes_upstream() {
    let mut backend = start_partial_backend(partial_response(100_000, 512), AfterPartial::Hold).await;
    let proxy = start_proxy(single_route_config(Protocol::Http2, Protocol::Http1, &[backend.addr])).await;
    let mut client = h2_client(proxy.addr).await;

    let (response, _) = client.send_request(request(Method::GET, "/big"), true).unwrap();
    let response = response.await.unwrap();
    assert_eq!(response.status(), 200);
    let mut body = response.into_body();
    let first = body.data().await.unwrap().unwrap();
    assert!(!first.is_empty());
    // Dropping the last handle cancels the stream with RST_STREAM.
    drop(body);

    tokio::time::timeout(Duration::from_secs(3), backend.torn_down.recv())
        .await
        .expect("upstream connection should close after the client reset")
        .unwrap();
}

#[tokio::test]
async fn upstream_disconnect_mid_body_resets_stream() {
    let backend = start_partial_backend(partial_response(100, 3), AfterPartial::Close).await;
    let proxy = start_proxy(single_route_config(Protocol::Http2, Protocol::Http1, &[backend.addr])).await;
    let mut client = h2_client(proxy.addr).await;

    let (response, _) = client.send_request(request(Method::GET, "/short"), true).unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(5), async {
        let response = response.await?;
        assert_eq!(response.status(), 200);
        let mut body = response.into_body();
        let mut received = Vec::new();
        while let Some(chunk) = body.data().await {
            received.extend_from_slice(&chunk?);
        }
        Ok::<_, h2::Error>(received)
    })
    .await
    .expect("stream should end");

    let err = outcome.expect_err("a truncated upstream body must not end the stream cleanly");
    assert!(err.reason().is_some(), "{err}");
}

#[tokio::test]
async fn h2_https_redirect_route_answers_301() {
    let (backend, recorded) = start_h2_echo_backend().await;
    let mut config = single_route_config(Protocol::Http2, Protocol::Http2, &[backend]);
    config.routes[0].https_redirect = true;
    let proxy = start_proxy(config).await;
    let mut client = h2_client(proxy.addr).await;

    let request = Request::builder()
        .method(Method::GET)
        .uri("http://www.redirect.com/foo")
        .body(())
        .unwrap();
    let (response, _) = client.send_request(request, true).unwrap();
    let response = response.await.unwrap();

    assert_eq!(response.status(), 301);
    assert_eq!(
        response.headers().get("location").unwrap(),
        "https://www.redirect.com/foo"
    );
    assert!(recorded.lock().unwrap().is_empty());
}
