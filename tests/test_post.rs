
use evq::Evq;
use evq::Error;

use std::mem::transmute;
use std::ops::Deref;
use std::sync::Mutex;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

#[test]
fn test_post() {
    let mut buffer = vec![0; 64*1024];
    let q = Evq::with_buffer(
        unsafe { transmute::<&mut [u8], &'static mut [u8]>(buffer.as_mut()) }
    ).unwrap();

    let count = AtomicU32::new(0);
    q.call(|| {
        count.fetch_add(1, Ordering::SeqCst);
    }).unwrap();
    q.dispatch_ready();

    assert_eq!(count.load(Ordering::SeqCst), 1);
    println!("usage: {:?}", q.usage());
}

#[test]
fn test_post_many() {
    let q = Evq::with_size(1024*1024);

    let count = AtomicU32::new(0);
    for _ in 0..1000 {
        q.call(|| {
            count.fetch_add(1, Ordering::SeqCst);
        }).unwrap();
    }
    q.dispatch_ready();

    assert_eq!(count.load(Ordering::SeqCst), 1000);
    println!("usage: {:?}", q.usage());
}

#[test]
fn test_post_order() {
    let q = Evq::with_size(1024*1024);

    let count = Mutex::new(Vec::new());
    for i in 0..1000 {
        let count = &count;
        q.call(move || {
            count.lock().unwrap().push(i)
        }).unwrap();
    }
    q.dispatch_ready();

    assert_eq!(
        count.lock().unwrap().deref(),
        &(0..1000).collect::<Vec<_>>()
    );
    println!("usage: {:?}", q.usage());
}

#[test]
fn test_post_from_event() {
    let q = Evq::with_size(64*1024);

    // a delay-0 post from inside an event joins the running drain pass
    let count = AtomicU32::new(0);
    q.call(|| {
        count.fetch_add(1, Ordering::SeqCst);
        q.call(|| {
            count.fetch_add(1, Ordering::SeqCst);
        }).unwrap();
    }).unwrap();
    q.dispatch_ready();

    assert_eq!(count.load(Ordering::SeqCst), 2);
    println!("usage: {:?}", q.usage());
}

#[test]
fn test_post_exhaustion() {
    let q = Evq::with_size(2*evq::EVENT_SIZE);

    let count = AtomicU32::new(0);
    assert!(q.call(|| { count.fetch_add(1, Ordering::SeqCst); }).is_ok());
    assert!(q.call(|| { count.fetch_add(1, Ordering::SeqCst); }).is_ok());
    assert_eq!(
        q.call(|| { count.fetch_add(1, Ordering::SeqCst); }).unwrap_err(),
        Error::NoMem
    );

    // the earlier posts are unharmed
    q.dispatch_ready();
    assert_eq!(count.load(Ordering::SeqCst), 2);

    // and slots are reusable afterwards
    assert!(q.call(|| { count.fetch_add(1, Ordering::SeqCst); }).is_ok());
    q.dispatch_ready();
    assert_eq!(count.load(Ordering::SeqCst), 3);
    println!("usage: {:?}", q.usage());
}

#[test]
fn test_post_event_builder() {
    let q = Evq::with_size(64*1024);

    let count = AtomicU32::new(0);
    q.alloc(|| {
        count.fetch_add(1, Ordering::SeqCst);
    }).unwrap().post();
    q.dispatch_ready();

    assert_eq!(count.load(Ordering::SeqCst), 1);

    // an unposted event just gives its slot back
    let total = q.usage().slots_free;
    let e = q.alloc(|| {}).unwrap();
    assert_eq!(q.usage().slots_free, total - 1);
    drop(e);
    assert_eq!(q.usage().slots_free, total);
    println!("usage: {:?}", q.usage());
}
