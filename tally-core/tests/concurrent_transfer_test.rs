//! Concurrent transfer tests
//!
//! Many threads move money back and forth between the same two accounts.
//! Every transfer must eventually commit exactly once, with no deadlock and
//! no lost update, on both store implementations.
//!
//! Run with: cargo test --test concurrent_transfer_test -- --nocapture

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

use tally_core::adapters::duckdb::DuckDbStore;
use tally_core::adapters::memory::MemoryStore;
use tally_core::config::Config;
use tally_core::ports::LedgerStore;
use tally_core::{Currency, LedgerContext, NewAccount, RequestContext, TransferRequest};

const THREAD_COUNT: usize = 8;
const TRANSFERS_PER_THREAD: usize = 5;
const AMOUNT: i64 = 10;
const INITIAL_BALANCE: i64 = 1_000;

/// Conflicts are expected under this much contention, so allow plenty of
/// attempts with short backoff.
fn contended_config() -> Config {
    Config {
        max_attempts: 200,
        base_delay_ms: 1,
        max_delay_ms: 20,
        ..Config::default()
    }
}

fn run_alternating_transfers(store: Arc<dyn LedgerStore>) -> (i64, i64) {
    let ctx = Arc::new(LedgerContext::with_store(store, contended_config()));
    let req = RequestContext::background();
    let a = ctx
        .account_service
        .create_account(&req, NewAccount::new("alice", Currency::Usd, INITIAL_BALANCE))
        .unwrap()
        .id;
    let b = ctx
        .account_service
        .create_account(&req, NewAccount::new("bob", Currency::Usd, INITIAL_BALANCE))
        .unwrap()
        .id;

    let barrier = Arc::new(Barrier::new(THREAD_COUNT));
    let mut handles = vec![];

    for thread_id in 0..THREAD_COUNT {
        let ctx = Arc::clone(&ctx);
        let barrier = Arc::clone(&barrier);

        handles.push(thread::spawn(move || {
            // Even threads pay a -> b, odd threads b -> a
            let (from, to) = if thread_id % 2 == 0 { (a, b) } else { (b, a) };
            barrier.wait();

            for _ in 0..TRANSFERS_PER_THREAD {
                ctx.transfer_service
                    .transfer(&RequestContext::background(), TransferRequest::new(from, to, AMOUNT))
                    .map_err(|e| format!("thread {}: {}", thread_id, e))?;
            }
            Ok::<(), String>(())
        }));
    }

    for handle in handles {
        handle.join().expect("thread panicked").unwrap();
    }

    let status = ctx.status_service.get_status(&req).unwrap();
    let total_transfers = (THREAD_COUNT * TRANSFERS_PER_THREAD) as i64;
    assert_eq!(status.total_transfers, total_transfers);
    assert_eq!(status.total_entries, total_transfers * 2);
    assert!(ctx.doctor_service.run_checks(&req).unwrap().is_healthy());

    let balance_a = ctx.account_service.get_account(&req, a).unwrap().balance;
    let balance_b = ctx.account_service.get_account(&req, b).unwrap().balance;
    (balance_a, balance_b)
}

#[test]
fn test_alternating_transfers_memory_store() {
    let (a, b) = run_alternating_transfers(Arc::new(MemoryStore::new()));
    // Equal thread counts in each direction cancel out
    assert_eq!(a, INITIAL_BALANCE);
    assert_eq!(b, INITIAL_BALANCE);
}

#[test]
fn test_alternating_transfers_duckdb_store() {
    let temp_dir = TempDir::new().unwrap();
    let store = DuckDbStore::open(&temp_dir.path().join("concurrent.duckdb")).unwrap();
    store.ensure_schema().unwrap();

    let (a, b) = run_alternating_transfers(Arc::new(store));
    assert_eq!(a, INITIAL_BALANCE);
    assert_eq!(b, INITIAL_BALANCE);
}

#[test]
fn test_one_directional_transfers_drain_exactly() {
    // 8 threads each try to move 10 five times out of an account holding 300:
    // exactly 30 succeed and the rest see insufficient funds.
    let ctx = Arc::new(LedgerContext::with_store(
        Arc::new(MemoryStore::new()),
        contended_config(),
    ));
    let req = RequestContext::background();
    let a = ctx
        .account_service
        .create_account(&req, NewAccount::new("alice", Currency::Eur, 300))
        .unwrap()
        .id;
    let b = ctx
        .account_service
        .create_account(&req, NewAccount::new("bob", Currency::Eur, 0))
        .unwrap()
        .id;

    let barrier = Arc::new(Barrier::new(THREAD_COUNT));
    let handles: Vec<_> = (0..THREAD_COUNT)
        .map(|_| {
            let ctx = Arc::clone(&ctx);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let mut succeeded = 0;
                for _ in 0..TRANSFERS_PER_THREAD {
                    match ctx
                        .transfer_service
                        .transfer(&RequestContext::background(), TransferRequest::new(a, b, AMOUNT))
                    {
                        Ok(_) => succeeded += 1,
                        Err(tally_core::Error::InsufficientFunds { .. }) => {}
                        Err(e) => panic!("unexpected error: {}", e),
                    }
                    thread::sleep(Duration::from_micros(50));
                }
                succeeded
            })
        })
        .collect();

    let succeeded: i64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(succeeded, 30);
    assert_eq!(ctx.account_service.get_account(&req, a).unwrap().balance, 0);
    assert_eq!(ctx.account_service.get_account(&req, b).unwrap().balance, 300);
}
