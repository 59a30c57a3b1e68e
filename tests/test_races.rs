
use evq::Evq;

use std::mem::transmute;
use std::sync::Arc;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::thread;

#[test]
fn test_post_race() {
    let mut buffer = vec![0; 1024*1024];
    let q = Arc::new(Evq::with_buffer(
        unsafe { transmute::<&mut [u8], &'static mut [u8]>(buffer.as_mut()) }
    ).unwrap());

    let count = Arc::new(AtomicU32::new(0));

    // producers hammer the queue while one thread dispatches
    let dispatcher = {
        let q = q.clone();
        thread::spawn(move || {
            q.dispatch(-1);
        })
    };

    let mut threads = vec![];
    for _ in 0..4 {
        let q = q.clone();
        let count = count.clone();
        threads.push(thread::spawn(move || {
            for _ in 0..250 {
                loop {
                    let count = count.clone();
                    if q.call(move || {
                        count.fetch_add(1, Ordering::SeqCst);
                    }).is_ok() {
                        break;
                    }
                    thread::yield_now();
                }
            }
        }));
    }

    for thread in threads.into_iter() {
        thread.join().unwrap();
    }
    q.break_dispatch();
    dispatcher.join().unwrap();

    // anything the break cut off is still pending
    q.dispatch_ready();
    assert_eq!(count.load(Ordering::SeqCst), 4*250);
    println!("usage: {:?}", q.usage());
}

#[test]
fn test_cancel_race() {
    let mut buffer = vec![0; 1024*1024];
    let q = Arc::new(Evq::with_buffer(
        unsafe { transmute::<&mut [u8], &'static mut [u8]>(buffer.as_mut()) }
    ).unwrap());

    let fired = Arc::new(AtomicU32::new(0));
    let cancelled = Arc::new(AtomicU32::new(0));

    let dispatcher = {
        let q = q.clone();
        thread::spawn(move || {
            q.dispatch(-1);
        })
    };

    let mut threads = vec![];
    for t in 0..4 {
        let q = q.clone();
        let fired = fired.clone();
        let cancelled = cancelled.clone();
        threads.push(thread::spawn(move || {
            for i in 0..200 {
                let fired = fired.clone();
                let id = loop {
                    let fired = fired.clone();
                    match q.call_in((t*13 + i) % 50, move || {
                        fired.fetch_add(1, Ordering::SeqCst);
                    }) {
                        Ok(id) => break id,
                        Err(_) => thread::yield_now(),
                    }
                };

                // cancel every other event, best effort
                if i % 2 == 0 && q.cancel(id) {
                    cancelled.fetch_add(1, Ordering::SeqCst);
                }
            }
        }));
    }

    for thread in threads.into_iter() {
        thread.join().unwrap();
    }

    // let the stragglers fire
    thread::sleep(std::time::Duration::from_millis(100));
    q.break_dispatch();
    dispatcher.join().unwrap();
    q.dispatch_ready();

    // every event either fired or was cancelled, never both, never
    // neither
    assert_eq!(
        fired.load(Ordering::SeqCst) + cancelled.load(Ordering::SeqCst),
        4*200
    );
    assert_eq!(q.usage().slots_pending, 0);
    println!("usage: {:?}", q.usage());
}
