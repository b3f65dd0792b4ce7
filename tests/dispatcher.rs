use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use http::header::{CONTENT_ENCODING, SERVER};
use http::{StatusCode, Uri};
use hyperdispatch::transport::mock::{MockFailure, MockReply, MockTransport};
use hyperdispatch::{
    AdmissionError, Pool, PoolConfig, Request, Response, SharedSettings, Transfer,
    TransportError,
};
use tokio::sync::mpsc;

fn pool(transport: &MockTransport, config: PoolConfig) -> Pool<MockTransport> {
    let _ = tracing_subscriber::fmt::try_init();
    Pool::builder()
        .with_config(config)
        .with_transport(transport.clone())
        .build()
        .unwrap()
}

fn get(uri: &str) -> Request {
    Request::get(uri.parse::<Uri>().unwrap())
}

/// Send a request whose response goes to `tx`.
fn send(pool: &Pool<MockTransport>, uri: &str, tx: &mpsc::UnboundedSender<Response>) {
    let tx = tx.clone();
    pool.send(get(uri), |_| true, move |response| {
        let _ = tx.send(response);
    })
    .unwrap();
}

#[tokio::test]
async fn queue_drain_scenario() {
    let transport = MockTransport::gated();
    let pool = pool(&transport, PoolConfig::default());
    let (tx, mut rx) = mpsc::unbounded_channel();

    for _ in 0..10 {
        send(&pool, "http://h.test/", &tx);
    }

    transport.wait_started(6).await;
    let host = pool.snapshot().host("h.test").cloned().unwrap();
    assert_eq!(host.active, 6);
    assert_eq!(host.queued, 4);
    assert_eq!(transport.started().len(), 6);

    for finished in 1..=4 {
        transport.release(1);
        transport.wait_finished(finished).await;
        transport.wait_started(6 + finished).await;

        assert_eq!(transport.started().len(), 6 + finished);
        assert_eq!(transport.current(), 6);
        assert_eq!(pool.snapshot().host("h.test").unwrap().queued, 4 - finished);
    }

    transport.release_all();
    for _ in 0..10 {
        let response = rx.recv().await.unwrap();
        assert!(response.is_ok());
    }

    assert_eq!(transport.peak_for("h.test"), 6);
    let stats = pool.snapshot().stats;
    assert_eq!(stats.dispatched, 10);
    assert_eq!(stats.dropped, 0);
    assert_eq!(stats.succeeded, 10);
}

#[tokio::test]
async fn global_cap_holds_across_hosts() {
    let transport = MockTransport::gated();
    let pool = pool(&transport, PoolConfig::new(4, 3));
    let (tx, mut rx) = mpsc::unbounded_channel();

    for host in ["a", "b", "c"] {
        for _ in 0..3 {
            send(&pool, &format!("http://{host}.test/"), &tx);
        }
    }

    transport.wait_started(4).await;
    let snapshot = pool.snapshot();
    assert_eq!(snapshot.active(), 4);
    assert_eq!(snapshot.queued(), 5);

    transport.release_all();
    for _ in 0..9 {
        rx.recv().await.unwrap();
    }

    assert!(transport.peak() <= 4);
    for host in ["a.test", "b.test", "c.test"] {
        assert!(transport.peak_for(host) <= 3);
    }
}

#[tokio::test]
async fn cross_host_independence() {
    let transport = MockTransport::gated();
    let pool = pool(&transport, PoolConfig::new(10, 2));
    let (tx, _rx) = mpsc::unbounded_channel();

    for _ in 0..4 {
        send(&pool, "http://a.test/", &tx);
    }
    transport.wait_started(2).await;

    send(&pool, "http://b.test/", &tx);
    transport.wait_started(3).await;

    let started = transport.started();
    assert_eq!(started[2].uri, "http://b.test/");
    assert_eq!(pool.snapshot().host("a.test").unwrap().queued, 2);

    transport.release_all();
}

#[tokio::test]
async fn fifo_per_host() {
    let transport = MockTransport::gated();
    let pool = pool(&transport, PoolConfig::new(10, 1));
    let (tx, mut rx) = mpsc::unbounded_channel();

    let ids: Vec<_> = (0..5)
        .map(|n| {
            let tx = tx.clone();
            pool.send(
                get(&format!("http://h.test/{n}")),
                |_| true,
                move |response| {
                    let _ = tx.send(response);
                },
            )
            .unwrap()
        })
        .collect();

    transport.release_all();
    let mut delivered = Vec::new();
    for _ in 0..5 {
        delivered.push(rx.recv().await.unwrap().request_id());
    }

    let started: Vec<_> = transport.started().iter().map(|s| s.request).collect();
    assert_eq!(started, ids);
    assert_eq!(delivered, ids);
}

#[tokio::test]
async fn hosts_take_turns_for_global_capacity() {
    let transport = MockTransport::gated();
    let pool = pool(&transport, PoolConfig::new(1, 6));
    let (tx, mut rx) = mpsc::unbounded_channel();

    send(&pool, "http://a.test/1", &tx);
    send(&pool, "http://a.test/2", &tx);
    send(&pool, "http://b.test/1", &tx);
    send(&pool, "http://b.test/2", &tx);

    transport.release_all();
    for _ in 0..4 {
        rx.recv().await.unwrap();
    }

    let order: Vec<String> = transport
        .started()
        .iter()
        .map(|s| s.uri.to_string())
        .collect();
    assert_eq!(
        order,
        [
            "http://a.test/1",
            "http://b.test/1",
            "http://a.test/2",
            "http://b.test/2"
        ]
    );
}

#[tokio::test]
async fn reuse_counter_scenario() {
    let transport = MockTransport::new();
    let pool = pool(&transport, PoolConfig::default());

    let first = pool.fetch(get("http://h.test/r1")).await.unwrap();
    assert!(first.is_ok());
    let second = pool.fetch(get("http://h.test/r2")).await.unwrap();
    assert!(second.is_ok());

    assert_eq!(transport.sessions(), 1);
    assert_eq!(pool.snapshot().stats.connections_created, 1);

    let started = transport.started();
    assert_eq!(started[0].session, started[1].session);
}

#[tokio::test]
async fn without_reuse_every_request_gets_a_connection() {
    let transport = MockTransport::new();
    let settings = SharedSettings::default();
    settings.set_reuse_connections(false);
    let pool = Pool::builder()
        .with_settings(settings)
        .with_transport(transport.clone())
        .build()
        .unwrap();

    for _ in 0..3 {
        pool.fetch(get("http://h.test/")).await.unwrap();
    }
    assert_eq!(transport.sessions(), 3);
}

#[tokio::test]
async fn rejection_invokes_nothing() {
    let transport = MockTransport::new();
    let pool = pool(&transport, PoolConfig::default());
    let calls = Arc::new(AtomicUsize::new(0));

    for target in ["/relative", "/search?q=1", "*"] {
        let uri = target.parse::<Uri>().unwrap();
        let transfers = calls.clone();
        let responses = calls.clone();
        let result = pool.send(
            Request::get(uri),
            move |_| {
                transfers.fetch_add(1, Ordering::SeqCst);
                true
            },
            move |_| {
                responses.fetch_add(1, Ordering::SeqCst);
            },
        );
        assert!(
            matches!(result, Err(AdmissionError::MissingAuthority(_))),
            "{target} was admitted"
        );
    }

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(transport.sessions(), 0);
    let snapshot = pool.snapshot();
    assert!(snapshot.hosts.is_empty());
    assert_eq!(snapshot.stats.rejected, 3);
}

#[tokio::test]
async fn shutdown_drains_nothing_new() {
    let transport = MockTransport::gated();
    let pool = pool(&transport, PoolConfig::new(10, 1));
    let dropped_calls = Arc::new(AtomicUsize::new(0));

    let (tx, rx) = tokio::sync::oneshot::channel();
    pool.send(get("http://h.test/running"), |_| true, move |response| {
        let _ = tx.send(response);
    })
    .unwrap();

    for n in 0..3 {
        let calls = dropped_calls.clone();
        pool.send(get(&format!("http://h.test/queued/{n}")), |_| true, move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    }
    transport.wait_started(1).await;

    pool.shutdown();
    pool.shutdown();

    let response = rx.await.unwrap();
    assert!(matches!(response.error(), Some(TransportError::Cancelled)));

    let refused = pool.send(get("http://h.test/late"), |_| true, |_| {});
    assert!(matches!(refused, Err(AdmissionError::ShuttingDown)));

    transport.release_all();
    pool.process_queue();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(transport.started().len(), 1);
    assert_eq!(dropped_calls.load(Ordering::SeqCst), 0);

    let snapshot = pool.snapshot();
    assert!(snapshot.shutdown);
    assert_eq!(snapshot.queued(), 0);
    assert_eq!(snapshot.stats.dropped, 4);
}

#[tokio::test]
async fn connections_return_to_ready() {
    let transport = MockTransport::new();
    transport.reply_all(MockReply::new(StatusCode::OK).delay(Duration::from_millis(5)));
    let pool = pool(&transport, PoolConfig::default());
    let (tx, mut rx) = mpsc::unbounded_channel();

    for n in 0..8 {
        send(&pool, &format!("http://h{}.test/", n % 3), &tx);
    }
    for _ in 0..8 {
        rx.recv().await.unwrap();
    }

    // Completion handlers release their connection before the response is
    // delivered, so nothing may still count as active now.
    assert_eq!(pool.snapshot().active(), 0);
}

#[tokio::test]
async fn transfer_callback_can_abort() {
    let transport = MockTransport::new();
    transport.reply_all(
        MockReply::new(StatusCode::OK)
            .body("0123456789")
            .ticks([
                Transfer {
                    current: 4,
                    total: Some(10),
                },
                Transfer {
                    current: 8,
                    total: Some(10),
                },
                Transfer {
                    current: 10,
                    total: Some(10),
                },
            ]),
    );
    let pool = pool(&transport, PoolConfig::default());

    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let (tx, rx) = tokio::sync::oneshot::channel();
    pool.send(
        get("http://h.test/download"),
        {
            let seen = seen.clone();
            move |transfer| {
                seen.lock().push(transfer.current);
                transfer.current < 8
            }
        },
        move |response| {
            let _ = tx.send(response);
        },
    )
    .unwrap();

    let response = rx.await.unwrap();
    assert!(matches!(response.error(), Some(TransportError::Aborted)));
    assert_eq!(*seen.lock(), vec![4, 8]);

    // A caller abort does not cancel the connection.
    pool.fetch(get("http://h.test/again")).await.unwrap();
    assert_eq!(transport.sessions(), 1);
}

#[tokio::test]
async fn transport_errors_reach_the_callback() {
    let transport = MockTransport::new();
    transport.reply(
        "http://h.test/dns",
        MockReply::failure(MockFailure::Dns),
    );
    transport.reply(
        "http://h.test/timeout",
        MockReply::failure(MockFailure::Timeout),
    );
    transport.reply(
        "http://h.test/teapot",
        MockReply::new(StatusCode::IM_A_TEAPOT),
    );
    let pool = pool(&transport, PoolConfig::default());

    let dns = pool.fetch(get("http://h.test/dns")).await.unwrap();
    assert!(matches!(dns.error(), Some(TransportError::Dns { .. })));
    assert_eq!(dns.status(), None);

    let timeout = pool.fetch(get("http://h.test/timeout")).await.unwrap();
    assert!(matches!(timeout.error(), Some(TransportError::Timeout)));

    let teapot = pool.fetch(get("http://h.test/teapot")).await.unwrap();
    assert!(teapot.is_ok());
    assert_eq!(teapot.status_code(), 418);
    assert_eq!(teapot.status_class(), 400);

    let stats = pool.snapshot().stats;
    assert_eq!(stats.failed, 2);
    assert_eq!(stats.succeeded, 1);
}

#[tokio::test]
async fn pipeline_runs_before_the_callback() {
    let plain = b"{\"data\":[1,2,3]}".repeat(50);
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
    std::io::Write::write_all(&mut encoder, &plain).unwrap();
    let compressed = encoder.finish().unwrap();

    let transport = MockTransport::new();
    transport.reply(
        "http://h.test/gzip",
        MockReply::new(StatusCode::OK)
            .header(CONTENT_ENCODING, "gzip")
            .body(compressed),
    );
    transport.reply(
        "http://h.test/challenge",
        MockReply::new(StatusCode::SERVICE_UNAVAILABLE).header(SERVER, "cloudflare"),
    );
    let pool = pool(&transport, PoolConfig::default());

    let response = pool.fetch(get("http://h.test/gzip")).await.unwrap();
    assert_eq!(response.body().as_ref(), plain.as_slice());
    assert!(!response.is_challenge());

    let response = pool.fetch(get("http://h.test/challenge")).await.unwrap();
    assert!(response.is_challenge());
}

#[tokio::test]
async fn cancelling_a_running_request_lets_the_queue_advance() {
    let transport = MockTransport::gated();
    let pool = pool(&transport, PoolConfig::new(10, 1));

    let running = pool.send(get("http://a.test/first"), |_| true, |_| {}).unwrap();
    let (tx, rx) = tokio::sync::oneshot::channel();
    pool.send(get("http://a.test/second"), |_| true, move |response| {
        let _ = tx.send(response);
    })
    .unwrap();
    transport.wait_started(1).await;
    assert_eq!(pool.snapshot().host("a.test").unwrap().queued, 1);

    assert!(pool.cancel(running));
    transport.release_all();

    let response = tokio::time::timeout(Duration::from_secs(2), rx)
        .await
        .expect("queued request was never dispatched")
        .unwrap();
    assert!(response.is_ok());

    let host = pool.snapshot().host("a.test").cloned().unwrap();
    assert_eq!(host.active, 0);
    assert_eq!(host.queued, 0);
    assert_eq!(transport.sessions(), 2);
}
