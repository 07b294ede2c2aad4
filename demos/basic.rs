//! Basic Circuit Breaker Example
//!
//! Two operation keys share one registry. The failing key opens and fails
//! fast while the healthy key keeps working, then the failing key recovers
//! through a single half-open trial.

use respool_rs::{BreakerError, CircuitBreaker, HookRegistry};
use std::error::Error;
use std::fmt;
use std::thread;
use std::time::Duration;

// Custom error type that implements Error trait
#[derive(Debug)]
struct ServiceError(String);

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Service error: {}", self.0)
    }
}

impl Error for ServiceError {}

fn inventory_lookup(attempt: u32) -> Result<String, ServiceError> {
    // Down for the first six calls, then back up
    if attempt <= 6 {
        Err(ServiceError("inventory backend unreachable".to_string()))
    } else {
        Ok(format!("{} items in stock", 40 + attempt))
    }
}

fn main() {
    let hooks = HookRegistry::new();
    hooks.set_on_open(|key| println!("  [{key}] circuit OPENED"));
    hooks.set_on_half_open(|key| println!("  [{key}] circuit HALF-OPEN, sending one trial"));
    hooks.set_on_close(|key| println!("  [{key}] circuit CLOSED"));

    let breaker = CircuitBreaker::builder()
        .failure_threshold(3)
        .reset_timeout(Duration::from_millis(800))
        .hooks(hooks)
        .build();

    let mut attempt = 0;
    for i in 1..=12 {
        println!("\nCall {}:", i);

        match breaker.call("inventory", || {
            attempt += 1;
            inventory_lookup(attempt)
        }) {
            Ok(result) => println!("  inventory: {}", result),
            Err(BreakerError::Open { key }) => println!("  {key} is open, skipped"),
            Err(BreakerError::Operation(err)) => println!("  inventory failed: {}", err),
        }

        // A different key is never affected by the inventory breaker
        let pricing = breaker.call("pricing", || Ok::<_, ServiceError>("9.99"));
        println!("  pricing: {:?}", pricing.ok());

        println!("  inventory state: {}", breaker.current_state("inventory"));
        thread::sleep(Duration::from_millis(250));
    }

    println!("\nFinal breakers:");
    for (key, snapshot) in breaker.snapshots() {
        println!(
            "  {key}: {} (successes {}, failures {}, rejections {})",
            snapshot.state, snapshot.successes, snapshot.failures, snapshot.rejections
        );
    }
}
