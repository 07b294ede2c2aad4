//! Resource Pool Example
//!
//! This example demonstrates:
//! 1. Implementing `ResourceManager` for a flaky connection source
//! 2. Creation retried with backoff under the `<name>:create` breaker
//! 3. Exhaustion when every handle is checked out
//! 4. Health checks replacing a dead connection, then a graceful shutdown

use futures::future::BoxFuture;
use respool_rs::{PoolError, ResourceManager, ResourcePool, RetryPolicy};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
#[error("connection refused on attempt {0}")]
struct ConnectError(u32);

#[derive(Debug)]
struct Connection {
    serial: u32,
}

#[derive(Default)]
struct Database {
    attempts: AtomicU32,
    serials: AtomicU32,
    dead_serial: AtomicU32,
    partitioned: AtomicBool,
}

struct Connector(Arc<Database>);

impl ResourceManager for Connector {
    type Resource = Connection;
    type Error = ConnectError;

    fn create(&self) -> BoxFuture<'_, Result<Connection, ConnectError>> {
        let attempt = self.0.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            // Every third connect attempt is refused
            if attempt % 3 == 0 || self.0.partitioned.load(Ordering::SeqCst) {
                return Err(ConnectError(attempt));
            }
            let serial = self.0.serials.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Connection { serial })
        })
    }

    fn check<'a>(&'a self, conn: &'a Connection) -> BoxFuture<'a, Result<bool, ConnectError>> {
        let dead = self.0.dead_serial.load(Ordering::SeqCst) == conn.serial;
        Box::pin(async move { Ok(!dead) })
    }

    fn destroy<'a>(&'a self, conn: &'a Connection) -> BoxFuture<'a, ()> {
        Box::pin(async move { println!("  closed connection #{}", conn.serial) })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    println!("=== Resource Pool Example ===\n");

    let db = Arc::new(Database::default());
    let pool = ResourcePool::builder(Connector(Arc::clone(&db)))
        .name("orders-db")
        .min_size(2)
        .max_size(3)
        .retry(RetryPolicy::new(4, Duration::from_millis(20), Duration::from_millis(200)))
        .shutdown_grace(Duration::from_millis(200))
        .build()
        .await?;
    println!("warmed up: {:?}\n", pool.stats());

    // Check out every handle; creation retries hide the refused attempts
    let mut held = Vec::new();
    for _ in 0..3 {
        let conn = pool.acquire(Duration::from_millis(100)).await?;
        println!("acquired connection #{}", conn.serial);
        held.push(conn);
    }

    match pool.acquire(Duration::from_millis(50)).await {
        Err(PoolError::Exhausted { timeout }) => {
            println!("pool exhausted after waiting {:?}", timeout)
        }
        other => println!("unexpected: {:?}", other.map(|c| c.serial)),
    }

    for conn in &held {
        pool.release(conn)?;
    }
    println!("\nreleased all: {:?}", pool.stats());

    // Mark one connection dead; the idle sweep evicts it
    db.dead_serial.store(held[0].serial, Ordering::SeqCst);
    let removed = pool.check_idle().await;
    println!("health sweep removed {}: {:?}", removed, pool.stats());

    // A partition trips the create breaker
    db.partitioned.store(true, Ordering::SeqCst);
    let create_key = format!("{}:create", pool.config().name);
    let mut drained = Vec::new();
    let mut failures = 0;
    while failures < 3 {
        match pool.acquire(Duration::from_millis(50)).await {
            Ok(conn) => drained.push(conn),
            Err(err) => {
                failures += 1;
                println!("\nacquire failed: {} (transient: {})", err, err.is_transient());
            }
        }
    }
    println!("create breaker: {}", pool.breaker().current_state(&create_key));

    let report = pool.close().await;
    println!("\nshutdown: {:?}", report);
    Ok(())
}
