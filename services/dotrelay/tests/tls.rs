mod harness;

use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::Ordering;
use std::time::Duration;

use dotrelay::{InboundTls, ProxyError, RelayServer, RetryPolicy};
use harness::{
    relay_config, roundtrip, spawn_relay, tls_client_connect, wait_until, EchoUpstream, TestCert,
    TEST_TIMEOUT,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

async fn bind_error(config: dotrelay::ProxyConfig) -> ProxyError {
    match RelayServer::bind(config).await {
        Ok(_) => panic!("relay should not start"),
        Err(e) => e,
    }
}

/// Read until the relay closes the socket, ignoring any alert bytes.
async fn drained_to_close(stream: &mut TcpStream) -> bool {
    let mut sink = Vec::new();
    timeout(TEST_TIMEOUT, stream.read_to_end(&mut sink))
        .await
        .is_ok()
}

#[tokio::test]
async fn inbound_tls_is_terminated() {
    let cert = TestCert::generate("localhost");
    let upstream = EchoUpstream::spawn().await.unwrap();
    let relay =
        spawn_relay(relay_config(upstream.addr).with_inbound_tls(cert.inbound_tls())).await;

    let mut client = tls_client_connect(relay.local_addr(), "localhost", &cert.cert_der)
        .await
        .unwrap();
    assert_eq!(
        roundtrip(&mut client, b"encrypted query").await.unwrap(),
        b"encrypted query"
    );

    // Upstream saw plaintext of the same length.
    let received = &upstream.bytes_received;
    assert!(wait_until(TEST_TIMEOUT, || received.load(Ordering::Relaxed) == 15).await);

    relay.shutdown().await;
}

#[tokio::test]
async fn untrusted_client_config_fails_cleanly() {
    let cert = TestCert::generate("localhost");
    let other = TestCert::generate("localhost");
    let upstream = EchoUpstream::spawn().await.unwrap();
    let relay =
        spawn_relay(relay_config(upstream.addr).with_inbound_tls(cert.inbound_tls())).await;
    let registry = relay.registry();

    let result = tls_client_connect(relay.local_addr(), "localhost", &other.cert_der).await;
    assert!(result.is_err(), "client must reject an unknown issuer");

    assert!(
        wait_until(TEST_TIMEOUT, || {
            registry.stats().handshake_failed.load(Ordering::Relaxed) == 1
        })
        .await
    );
    assert!(wait_until(TEST_TIMEOUT, || registry.is_empty()).await);
    assert_eq!(upstream.connection_count(), 0);

    // The relay keeps serving well-behaved clients.
    let mut good = tls_client_connect(relay.local_addr(), "localhost", &cert.cert_der)
        .await
        .unwrap();
    assert_eq!(roundtrip(&mut good, b"fine").await.unwrap(), b"fine");

    relay.shutdown().await;
}

#[tokio::test]
async fn wrong_server_name_is_rejected_by_client() {
    let cert = TestCert::generate("localhost");
    let upstream = EchoUpstream::spawn().await.unwrap();
    let relay =
        spawn_relay(relay_config(upstream.addr).with_inbound_tls(cert.inbound_tls())).await;

    let result = tls_client_connect(relay.local_addr(), "dns.example.net", &cert.cert_der).await;
    assert!(result.is_err());
    assert_eq!(upstream.connection_count(), 0);

    relay.shutdown().await;
}

#[tokio::test]
async fn plaintext_on_tls_listener_is_closed() {
    let cert = TestCert::generate("localhost");
    let upstream = EchoUpstream::spawn().await.unwrap();
    let relay =
        spawn_relay(relay_config(upstream.addr).with_inbound_tls(cert.inbound_tls())).await;
    let registry = relay.registry();

    let mut client = TcpStream::connect(relay.local_addr()).await.unwrap();
    client.write_all(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();
    assert!(drained_to_close(&mut client).await);

    assert!(
        wait_until(TEST_TIMEOUT, || {
            registry.stats().handshake_failed.load(Ordering::Relaxed) == 1
        })
        .await
    );
    assert_eq!(upstream.connection_count(), 0);

    relay.shutdown().await;
}

#[tokio::test]
async fn stalled_handshake_times_out() {
    let cert = TestCert::generate("localhost");
    let upstream = EchoUpstream::spawn().await.unwrap();
    let relay = spawn_relay(
        relay_config(upstream.addr)
            .with_inbound_tls(cert.inbound_tls())
            .with_handshake_timeout(Duration::from_millis(200)),
    )
    .await;

    let mut client = TcpStream::connect(relay.local_addr()).await.unwrap();
    assert!(drained_to_close(&mut client).await);
    let registry = relay.registry();
    assert!(wait_until(TEST_TIMEOUT, || registry.is_empty()).await);
    assert_eq!(
        registry.stats().handshake_failed.load(Ordering::Relaxed),
        1
    );

    relay.shutdown().await;
}

#[tokio::test]
async fn outbound_tls_reaches_tls_upstream() {
    let upstream_cert = TestCert::generate("localhost");
    let upstream = EchoUpstream::spawn_tls(&upstream_cert).await.unwrap();
    let relay = spawn_relay(relay_config(upstream.addr).with_outbound_tls(
        Some("localhost".to_string()),
        Some(upstream_cert.cert_path().to_path_buf()),
    ))
    .await;

    let mut client = TcpStream::connect(relay.local_addr()).await.unwrap();
    assert_eq!(
        roundtrip(&mut client, b"to resolver").await.unwrap(),
        b"to resolver"
    );
    assert_eq!(relay.connector().stats().established, 1);

    relay.shutdown().await;
}

#[tokio::test]
async fn tls_on_both_sides() {
    let relay_cert = TestCert::generate("localhost");
    let upstream_cert = TestCert::generate("localhost");
    let upstream = EchoUpstream::spawn_tls(&upstream_cert).await.unwrap();
    let relay = spawn_relay(
        relay_config(upstream.addr)
            .with_inbound_tls(relay_cert.inbound_tls())
            .with_outbound_tls(
                Some("localhost".to_string()),
                Some(upstream_cert.cert_path().to_path_buf()),
            ),
    )
    .await;

    let mut client = tls_client_connect(relay.local_addr(), "localhost", &relay_cert.cert_der)
        .await
        .unwrap();
    for _ in 0..5 {
        let echoed = roundtrip(&mut client, &[0x42; 2048]).await.unwrap();
        assert_eq!(echoed, [0x42; 2048]);
    }

    relay.shutdown().await;
}

#[tokio::test]
async fn upstream_certificate_mismatch_closes_client() {
    let upstream_cert = TestCert::generate("localhost");
    let upstream = EchoUpstream::spawn_tls(&upstream_cert).await.unwrap();
    let relay = spawn_relay(
        relay_config(upstream.addr)
            .with_outbound_tls(
                Some("resolver.example.net".to_string()),
                Some(upstream_cert.cert_path().to_path_buf()),
            )
            .with_retry(RetryPolicy::no_retry()),
    )
    .await;
    let registry = relay.registry();

    let mut client = TcpStream::connect(relay.local_addr()).await.unwrap();
    assert!(drained_to_close(&mut client).await);
    assert!(
        wait_until(TEST_TIMEOUT, || {
            registry.stats().upstream_failed.load(Ordering::Relaxed) == 1
        })
        .await
    );

    relay.shutdown().await;
}

#[tokio::test]
async fn missing_certificate_is_fatal_and_leaves_port_free() {
    let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = probe.local_addr().unwrap().port();
    drop(probe);

    let upstream = EchoUpstream::spawn().await.unwrap();
    let err = bind_error(
        relay_config(upstream.addr)
            .with_listen(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
            .with_inbound_tls(InboundTls::new(
                "/nonexistent/certificate.pem",
                "/nonexistent/privatekey.pem",
            )),
    )
    .await;

    assert!(matches!(err, ProxyError::CertLoad { .. }), "got {err}");
    assert!(err.is_fatal());
    assert_eq!(err.reason_code(), "cert_load_failed");

    TcpListener::bind(("127.0.0.1", port)).await.unwrap();
}

#[tokio::test]
async fn key_file_without_key_is_fatal() {
    let cert = TestCert::generate("localhost");
    let upstream = EchoUpstream::spawn().await.unwrap();

    // Certificate PEM in place of the key.
    let err = bind_error(
        relay_config(upstream.addr)
            .with_inbound_tls(InboundTls::new(cert.cert_path(), cert.cert_path())),
    )
    .await;
    assert!(matches!(err, ProxyError::CertLoad { .. }), "got {err}");
}

#[tokio::test]
async fn port_in_use_is_fatal() {
    let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = occupied.local_addr().unwrap().port();

    let upstream = EchoUpstream::spawn().await.unwrap();
    let err = bind_error(
        relay_config(upstream.addr).with_listen(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
    )
    .await;

    assert!(matches!(err, ProxyError::Bind { .. }), "got {err}");
    assert!(err.is_fatal());
}
