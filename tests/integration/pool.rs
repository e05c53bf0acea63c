use crate::*;

use tether_session::{ConnectionPool, PoolSettings, SessionError, SessionOptions, TcpDialer};

fn settings(min_sessions: u64, send_queue_size: usize) -> PoolSettings {
    PoolSettings::new(
        min_sessions,
        15,
        SessionOptions {
            send_queue_size,
            ..SessionOptions::default()
        },
    )
}

/// A pool over real TCP hands out a working session on first use.
#[tokio::test]
async fn test_pool_first_session_round_trip() -> Result<()> {
    let (addr, stats) = spawn_echo_server().await?;
    let pool = ConnectionPool::new(TcpDialer::new(addr.to_string(), LineProtocol), settings(1, 0));

    let session = pool.get_session().await?;
    session.send("ping".to_string()).await?;
    assert_eq!(session.receive().await?, "ping");

    assert_eq!(pool.len(), 1);
    assert_eq!(stats.accepted(), 1);

    pool.stop().await;
    wait_until(Duration::from_secs(2), || stats.finished() == 1).await?;
    Ok(())
}

/// min_sessions = 3 → three sequential calls leave at least three connections.
#[tokio::test]
async fn test_pool_grows_to_min_sessions() -> Result<()> {
    let (addr, stats) = spawn_echo_server().await?;
    let pool = ConnectionPool::new(TcpDialer::new(addr.to_string(), LineProtocol), settings(3, 0));

    for _ in 0..3 {
        pool.get_session().await?;
    }
    wait_until(Duration::from_secs(2), || pool.len() >= 3).await?;
    wait_until(Duration::from_secs(2), || stats.accepted() >= 3).await?;

    pool.stop().await;
    assert!(pool.is_empty());
    Ok(())
}

/// Nobody listening → the very first call reports the dial failure.
#[tokio::test]
async fn test_pool_dial_failure_surfaces() -> Result<()> {
    let addr = {
        let l = std::net::TcpListener::bind("127.0.0.1:0")?;
        l.local_addr()?
    };
    let pool = ConnectionPool::new(TcpDialer::new(addr.to_string(), LineProtocol), settings(1, 0));

    match pool.get_session().await {
        Err(SessionError::Factory(_)) => {}
        other => bail!("expected Factory error, got {:?}", other.map(|s| s.id())),
    }
    assert!(pool.is_empty());
    Ok(())
}

/// serve() runs a receive loop per session; stop() ends it and every loop
/// observes the close.
#[tokio::test]
async fn test_pool_serve_and_stop() -> Result<()> {
    let (addr, _) = spawn_echo_server().await?;
    let pool = ConnectionPool::new(TcpDialer::new(addr.to_string(), LineProtocol), settings(2, 8));

    let received = Arc::new(AtomicUsize::new(0));
    let loops_started = Arc::new(AtomicUsize::new(0));
    let loops_done = Arc::new(AtomicUsize::new(0));
    let server = {
        let pool = pool.clone();
        let received = received.clone();
        let loops_started = loops_started.clone();
        let loops_done = loops_done.clone();
        tokio::spawn(async move {
            pool.serve(move |session| {
                let received = received.clone();
                let loops_done = loops_done.clone();
                loops_started.fetch_add(1, Ordering::SeqCst);
                async move {
                    while session.receive().await.is_ok() {
                        received.fetch_add(1, Ordering::SeqCst);
                    }
                    loops_done.fetch_add(1, Ordering::SeqCst);
                }
            })
            .await
        })
    };

    for i in 0..4 {
        let session = pool.get_session().await?;
        session.send(format!("msg-{i}")).await?;
    }
    wait_until(Duration::from_secs(2), || received.load(Ordering::SeqCst) == 4).await?;

    let sessions = pool.len();
    assert!(sessions >= 2, "expected at least min_sessions, got {sessions}");

    pool.stop().await;
    server.await??;
    wait_until(Duration::from_secs(2), || {
        loops_done.load(Ordering::SeqCst) == loops_started.load(Ordering::SeqCst)
    })
    .await?;
    assert!(pool.is_empty());
    Ok(())
}
