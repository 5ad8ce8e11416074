mod harness;

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use dotrelay::RetryPolicy;
use harness::{
    closed_within, dead_addr, relay_config, roundtrip, spawn_relay, wait_until, EchoUpstream,
    TEST_TIMEOUT,
};
use tokio::net::{TcpListener, TcpStream};

#[tokio::test]
async fn unreachable_upstream_closes_client() {
    let relay = spawn_relay(relay_config(dead_addr().await)).await;
    let registry = relay.registry();

    let mut client = TcpStream::connect(relay.local_addr()).await.unwrap();
    assert!(closed_within(&mut client, TEST_TIMEOUT).await);

    assert!(
        wait_until(TEST_TIMEOUT, || {
            registry.stats().upstream_failed.load(Ordering::Relaxed) == 1
        })
        .await
    );
    assert!(wait_until(TEST_TIMEOUT, || registry.is_empty()).await);

    relay.shutdown().await;
}

#[tokio::test]
async fn failed_connection_does_not_affect_the_next() {
    let upstream = EchoUpstream::spawn().await.unwrap();
    let addr = upstream.addr;
    drop(upstream);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let relay = spawn_relay(relay_config(addr)).await;

    let mut first = TcpStream::connect(relay.local_addr()).await.unwrap();
    assert!(closed_within(&mut first, TEST_TIMEOUT).await);

    // Bring the upstream back on the same port.
    let listener = TcpListener::bind(addr).await.unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = stream.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });

    let mut second = TcpStream::connect(relay.local_addr()).await.unwrap();
    assert_eq!(roundtrip(&mut second, b"back").await.unwrap(), b"back");

    relay.shutdown().await;
}

#[tokio::test]
async fn bounded_retry_gives_up_after_max_attempts() {
    let retry = RetryPolicy {
        max_attempts: 3,
        initial_backoff: Duration::from_millis(50),
        max_backoff: Duration::from_millis(200),
    };
    let relay = spawn_relay(relay_config(dead_addr().await).with_retry(retry)).await;
    let connector = relay.connector();

    let started = Instant::now();
    let mut client = TcpStream::connect(relay.local_addr()).await.unwrap();
    assert!(closed_within(&mut client, TEST_TIMEOUT).await);

    // Two backoffs: 50ms then 100ms.
    assert!(started.elapsed() >= Duration::from_millis(150));
    assert_eq!(connector.stats().attempts, 3);
    assert_eq!(connector.stats().established, 0);

    relay.shutdown().await;
}

#[tokio::test]
async fn retry_succeeds_when_upstream_appears() {
    let addr = dead_addr().await;
    let retry = RetryPolicy {
        max_attempts: 10,
        initial_backoff: Duration::from_millis(50),
        max_backoff: Duration::from_millis(100),
    };
    let relay = spawn_relay(relay_config(addr).with_retry(retry)).await;

    let client_task = {
        let relay_addr = relay.local_addr();
        tokio::spawn(async move {
            let mut client = TcpStream::connect(relay_addr).await.unwrap();
            roundtrip(&mut client, b"patience").await
        })
    };

    tokio::time::sleep(Duration::from_millis(120)).await;
    let listener = TcpListener::bind(addr).await.unwrap();
    tokio::spawn(async move {
        if let Ok((mut stream, _)) = listener.accept().await {
            let (mut r, mut w) = stream.split();
            let _ = tokio::io::copy(&mut r, &mut w).await;
        }
    });

    assert_eq!(client_task.await.unwrap().unwrap(), b"patience");
    assert!(relay.connector().stats().attempts > 1);

    relay.shutdown().await;
}
