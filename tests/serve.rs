use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use weft::{BodyShape, Context, Server, ServerConfig, middleware};

/// Counts how many times the server's shutdown hooks run.
fn count_shutdowns(server: &mut Server) -> Arc<AtomicUsize> {
    let closed = Arc::new(AtomicUsize::new(0));
    let hook = Arc::clone(&closed);
    server.on_shutdown(move || {
        hook.fetch_add(1, Ordering::SeqCst);
    });
    closed
}

/// A `GET /slow` route that signals `entered` and then takes `delay`.
fn slow_route(server: &mut Server, entered: &Arc<Notify>, delay: Duration) {
    let entered = Arc::clone(entered);
    server.get(
        "/slow",
        move |ctx: Context| {
            let entered = Arc::clone(&entered);
            async move {
                entered.notify_one();
                tokio::time::sleep(delay).await;
                ctx.wrap_text("done", http::StatusCode::OK)
            }
        },
        BodyShape::None,
    );
}

#[tokio::test]
async fn serves_over_a_real_socket_and_shuts_down_cleanly() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let mut server = Server::new(ServerConfig::default().listener(listener)).unwrap();
    server.wrap_handler(-100, middleware::recover());
    server.get(
        "/ping/:who",
        |ctx: Context| async move {
            ctx.wrap_text(format!("pong {}", ctx.path_param("who").unwrap_or("?")), http::StatusCode::OK)
        },
        BodyShape::None,
    );
    let closed = count_shutdowns(&mut server);

    let app = server.build();
    let shutdown = app.shutdown_token();
    let running = tokio::spawn(app.run(None));

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /ping/weft HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();
    let text = String::from_utf8_lossy(&raw);

    assert!(text.starts_with("HTTP/1.1 200 OK"), "{text}");
    assert!(text.ends_with("pong weft"), "{text}");

    shutdown.cancel();
    running.await.unwrap().unwrap();
    assert_eq!(closed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn in_flight_request_completes_after_shutdown_is_requested() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let entered = Arc::new(Notify::new());

    let mut server = Server::new(ServerConfig::default().listener(listener)).unwrap();
    slow_route(&mut server, &entered, Duration::from_millis(300));
    let closed = count_shutdowns(&mut server);

    let app = server.build();
    let shutdown = app.shutdown_token();
    let running = tokio::spawn(app.run(None));

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(b"GET /slow HTTP/1.1\r\nHost: localhost\r\n\r\n").await.unwrap();
    entered.notified().await;
    shutdown.cancel();

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();
    let text = String::from_utf8_lossy(&raw);
    assert!(text.starts_with("HTTP/1.1 200 OK"), "{text}");
    assert!(text.ends_with("done"), "{text}");

    running.await.unwrap().unwrap();
    assert_eq!(closed.load(Ordering::SeqCst), 1);
    assert!(TcpStream::connect(addr).await.is_err(), "listener still accepting after shutdown");
}

#[tokio::test]
async fn connections_outliving_the_grace_period_are_aborted() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let entered = Arc::new(Notify::new());
    let grace = Duration::from_millis(100);

    let config = ServerConfig::default().listener(listener).shutdown_grace(grace);
    let mut server = Server::new(config).unwrap();
    slow_route(&mut server, &entered, Duration::from_secs(60));
    let closed = count_shutdowns(&mut server);

    let app = server.build();
    let shutdown = app.shutdown_token();
    let running = tokio::spawn(app.run(None));

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(b"GET /slow HTTP/1.1\r\nHost: localhost\r\n\r\n").await.unwrap();
    entered.notified().await;
    let requested = Instant::now();
    shutdown.cancel();

    tokio::time::timeout(Duration::from_secs(10), running)
        .await
        .expect("run did not return after the grace period")
        .unwrap()
        .unwrap();
    assert!(requested.elapsed() >= grace);
    assert_eq!(closed.load(Ordering::SeqCst), 1);

    let mut raw = Vec::new();
    let _ = stream.read_to_end(&mut raw).await;
    assert!(!String::from_utf8_lossy(&raw).contains("200 OK"));
}
