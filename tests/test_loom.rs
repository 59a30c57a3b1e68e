#![cfg(feature = "loom")]

use evq::Evq;
use evq::SysClock;

use std::sync::Arc;

use loom::sync::atomic::AtomicU32;
use loom::sync::atomic::Ordering;
use loom::thread;

// These only run with the loom sys layer, which build.rs selects when the
// feature is enabled:
//
//   cargo test --features loom --test test_loom --release
//

#[test]
fn loom_post_vs_dispatch() {
    loom::model(|| {
        SysClock::set_now(0);
        let q = Arc::new(Evq::with_size(4*evq::EVENT_SIZE));
        let count = Arc::new(AtomicU32::new(0));

        let thread = {
            let q = q.clone();
            let count = count.clone();
            thread::spawn(move || {
                let count = count.clone();
                q.call(move || {
                    count.fetch_add(1, Ordering::SeqCst);
                }).unwrap();
            })
        };

        // racing with the post, may or may not see the event
        q.dispatch_ready();

        thread.join().unwrap();
        q.dispatch_ready();

        // but never zero or twice once the post has settled
        assert_eq!(count.load(Ordering::SeqCst), 1);
    });
}

#[test]
fn loom_cancel_vs_dispatch() {
    loom::model(|| {
        SysClock::set_now(0);
        let q = Arc::new(Evq::with_size(4*evq::EVENT_SIZE));
        let count = Arc::new(AtomicU32::new(0));

        let count2 = count.clone();
        let id = q.call(move || {
            count2.fetch_add(1, Ordering::SeqCst);
        }).unwrap();

        let thread = {
            let q = q.clone();
            thread::spawn(move || {
                q.dispatch_ready();
            })
        };

        let cancelled = q.cancel(id);

        thread.join().unwrap();
        q.dispatch_ready();

        // exactly one side wins, a cancelled event never fires and a
        // fired event never reports cancelled
        let fired = count.load(Ordering::SeqCst);
        assert_eq!(fired + cancelled as u32, 1);
    });
}

#[test]
fn loom_post_race_ids_unique() {
    loom::model(|| {
        SysClock::set_now(0);
        let q = Arc::new(Evq::with_size(4*evq::EVENT_SIZE));

        let thread = {
            let q = q.clone();
            thread::spawn(move || {
                q.call(|| {}).unwrap()
            })
        };

        let id1 = q.call(|| {}).unwrap();
        let id2 = thread.join().unwrap();
        assert_ne!(id1, id2);

        q.dispatch_ready();
        q.dispatch_ready();
    });
}
