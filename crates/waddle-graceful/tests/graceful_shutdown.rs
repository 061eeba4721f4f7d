//! End-to-end graceful shutdown tests over real sockets.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use waddle_graceful::{Error, GracefulConfig, GracefulConnection, GracefulServer, Listener};

/// Default timeout for test operations.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// How long to watch something that should stay blocked.
const SETTLE: Duration = Duration::from_millis(100);

/// Echo until the peer closes, then close our side.
async fn echo_until_eof(mut conn: GracefulConnection<TcpStream>, _peer: SocketAddr) {
    let mut buf = [0u8; 1024];
    loop {
        match conn.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if conn.write_all(&buf[..n]).await.is_err() {
                    break;
                }
            }
        }
    }
    let _ = conn.close().await;
}

/// Poll `cond` until it holds or the default timeout expires.
async fn wait_until(mut cond: impl FnMut() -> bool) {
    timeout(DEFAULT_TIMEOUT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Connect repeatedly until the OS refuses, proving the listener is gone.
async fn wait_until_refused(addr: SocketAddr) {
    timeout(DEFAULT_TIMEOUT, async {
        loop {
            match TcpStream::connect(addr).await {
                Err(e) => {
                    assert_eq!(e.kind(), io::ErrorKind::ConnectionRefused);
                    return;
                }
                Ok(probe) => {
                    drop(probe);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
    })
    .await
    .expect("listener still accepting connections");
}

async fn bound() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

#[tokio::test]
async fn test_shutdown_waits_for_open_connection() {
    let (tcp, addr) = bound().await;
    let server = Arc::new(GracefulServer::new(GracefulConfig::default(), echo_until_eof));
    let handle = server.shutdown_handle();
    let listener = server.wrap(tcp).unwrap();

    let serving = {
        let server = Arc::clone(&server);
        let listener = Arc::clone(&listener);
        tokio::spawn(async move { server.serve(listener).await })
    };

    let mut c1 = TcpStream::connect(addr).await.unwrap();
    c1.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    c1.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");
    assert_eq!(server.active_units(), 1);

    handle.shutdown();
    wait_until(|| !listener.is_open()).await;
    wait_until_refused(addr).await;

    tokio::time::sleep(SETTLE).await;
    assert!(!serving.is_finished(), "serve must wait for C1");
    assert_eq!(server.active_units(), 1);

    drop(c1);
    let result = timeout(DEFAULT_TIMEOUT, serving)
        .await
        .expect("serve should return once C1 closes")
        .unwrap();
    assert!(result.is_ok(), "graceful shutdown reported {result:?}");
    assert_eq!(server.active_units(), 0);
}

#[tokio::test]
async fn test_routine_delays_shutdown() {
    let (tcp, _addr) = bound().await;
    let server = Arc::new(GracefulServer::new(GracefulConfig::default(), echo_until_eof));
    let listener = server.wrap(tcp).unwrap();

    server.start_routine();

    let serving = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.serve(listener).await })
    };

    server.shutdown_handle().shutdown();
    tokio::time::sleep(SETTLE).await;
    assert!(!serving.is_finished(), "serve must wait for the routine");

    server.finish_routine();
    let result = timeout(DEFAULT_TIMEOUT, serving).await.unwrap().unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_spawned_routine_delays_shutdown() {
    let (tcp, _addr) = bound().await;
    let server = Arc::new(GracefulServer::new(GracefulConfig::default(), echo_until_eof));
    let listener = server.wrap(tcp).unwrap();
    let (release, released) = tokio::sync::oneshot::channel::<()>();

    server.run_routine(async move {
        let _ = released.await;
    });

    let serving = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.serve(listener).await })
    };

    server.shutdown_handle().shutdown();
    tokio::time::sleep(SETTLE).await;
    assert!(!serving.is_finished());

    release.send(()).unwrap();
    let result = timeout(DEFAULT_TIMEOUT, serving).await.unwrap().unwrap();
    assert!(result.is_ok());
}

/// Every accept fails while the listener is open.
struct BrokenListener;

impl Listener for BrokenListener {
    type Io = DuplexStream;
    type Addr = &'static str;

    fn accept(&self) -> impl Future<Output = io::Result<(Self::Io, Self::Addr)>> + Send {
        async { Err(io::Error::new(io::ErrorKind::Other, "accept exploded")) }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        Ok("broken")
    }
}

#[tokio::test]
async fn test_accept_error_is_propagated_without_drain() {
    let server = GracefulServer::new(
        GracefulConfig::default(),
        |conn: GracefulConnection<DuplexStream>, _peer: &'static str| async move {
            let _ = conn.close().await;
        },
    );
    let _busy = server.routine_guard();
    let listener = server.wrap(BrokenListener).unwrap();

    let err = timeout(DEFAULT_TIMEOUT, server.serve(listener))
        .await
        .expect("an open accept failure must not drain")
        .unwrap_err();

    let raw = err.as_accept_error().expect("expected the raw accept error");
    assert_eq!(raw.to_string(), "accept exploded");
    assert_eq!(server.active_units(), 1);
}

#[tokio::test]
async fn test_drain_timeout_bounds_shutdown() {
    let (tcp, addr) = bound().await;
    let config = GracefulConfig::default().with_drain_timeout(Duration::from_millis(200));
    let server = Arc::new(GracefulServer::new(
        config,
        |conn: GracefulConnection<TcpStream>, _peer: SocketAddr| async move {
            // Hold the connection forever.
            let _conn = conn;
            std::future::pending::<()>().await;
        },
    ));
    let listener = server.wrap(tcp).unwrap();

    let serving = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.serve(listener).await })
    };

    let _client = TcpStream::connect(addr).await.unwrap();
    wait_until(|| server.active_units() == 1).await;

    server.shutdown_handle().shutdown();
    let err = timeout(DEFAULT_TIMEOUT, serving)
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, Error::DrainTimedOut { remaining: 1 }));
}

#[tokio::test]
async fn test_servers_shut_down_independently() {
    let (tcp_a, _addr_a) = bound().await;
    let (tcp_b, addr_b) = bound().await;
    let a = Arc::new(GracefulServer::new(GracefulConfig::default(), echo_until_eof));
    let b = Arc::new(GracefulServer::new(GracefulConfig::default(), echo_until_eof));
    let listener_a = a.wrap(tcp_a).unwrap();
    let listener_b = b.wrap(tcp_b).unwrap();

    let serving_a = {
        let a = Arc::clone(&a);
        tokio::spawn(async move { a.serve(listener_a).await })
    };
    let serving_b = {
        let b = Arc::clone(&b);
        tokio::spawn(async move { b.serve(listener_b).await })
    };

    a.shutdown_handle().shutdown();
    let result = timeout(DEFAULT_TIMEOUT, serving_a).await.unwrap().unwrap();
    assert!(result.is_ok());

    // B is untouched by A's shutdown.
    let mut client = TcpStream::connect(addr_b).await.unwrap();
    client.write_all(b"still here").await.unwrap();
    let mut buf = [0u8; 10];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"still here");
    assert!(!serving_b.is_finished());

    drop(client);
    b.shutdown_handle().shutdown();
    let result = timeout(DEFAULT_TIMEOUT, serving_b).await.unwrap().unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_serve_fn_with_shutdown_future() {
    let (tcp, addr) = bound().await;
    let (stop, stopped) = tokio::sync::oneshot::channel::<()>();

    let serving = tokio::spawn(waddle_graceful::serve(tcp, echo_until_eof, async move {
        let _ = stopped.await;
    }));

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"hi").await.unwrap();
    let mut buf = [0u8; 2];
    client.read_exact(&mut buf).await.unwrap();
    drop(client);

    stop.send(()).unwrap();
    let result = timeout(DEFAULT_TIMEOUT, serving).await.unwrap().unwrap();
    assert!(result.is_ok());
    wait_until_refused(addr).await;
}

#[tokio::test]
async fn test_listen_and_serve_fn_with_shutdown_future() {
    // Reserve a free port, then release it for the server to bind.
    let (tcp, addr) = bound().await;
    drop(tcp);

    let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
    let serving = tokio::spawn(waddle_graceful::listen_and_serve(
        addr.to_string(),
        echo_until_eof,
        async move {
            let _ = stopped.await;
        },
    ));

    let mut client = timeout(DEFAULT_TIMEOUT, async {
        loop {
            if let Ok(stream) = TcpStream::connect(addr).await {
                return stream;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("server never started listening");

    client.write_all(b"ok").await.unwrap();
    let mut buf = [0u8; 2];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ok");
    drop(client);

    stop.send(()).unwrap();
    let result = timeout(DEFAULT_TIMEOUT, serving).await.unwrap().unwrap();
    assert!(result.is_ok());
}

#[cfg(unix)]
#[tokio::test]
async fn test_unix_listener_shutdown() {
    use tokio::net::{UnixListener, UnixStream};

    let path = std::env::temp_dir().join(format!("waddle-graceful-{}.sock", std::process::id()));
    let _ = std::fs::remove_file(&path);
    let unix = UnixListener::bind(&path).unwrap();

    let server = Arc::new(GracefulServer::new(
        GracefulConfig::default(),
        |mut conn: GracefulConnection<UnixStream>, _peer: tokio::net::unix::SocketAddr| async move {
            let _ = conn.write_all(b"bye").await;
            let _ = conn.close().await;
        },
    ));
    let listener = server.wrap(unix).unwrap();
    let serving = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.serve(listener).await })
    };

    let mut client = UnixStream::connect(&path).await.unwrap();
    let mut reply = Vec::new();
    client.read_to_end(&mut reply).await.unwrap();
    assert_eq!(reply, b"bye");

    server.shutdown_handle().shutdown();
    let result = timeout(DEFAULT_TIMEOUT, serving).await.unwrap().unwrap();
    assert!(result.is_ok());

    let _ = std::fs::remove_file(&path);
}
