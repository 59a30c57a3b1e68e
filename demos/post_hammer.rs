
use evq::Evq;

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use rand::Rng;
use structopt::StructOpt;

#[derive(Debug, StructOpt, Clone)]
#[structopt(rename_all="kebab")]
struct Opt {
    /// Number of producer threads
    #[structopt(short, long, default_value="8")]
    producers: usize,

    /// Queue buffer size in bytes
    #[structopt(short, long, default_value="1048576")]
    size: usize,

    /// Largest random delay in ms
    #[structopt(short, long, default_value="100")]
    delay: i32,
}

fn main() {
    let opt = Opt::from_args();

    let q = Arc::new(Evq::with_size(opt.size));
    let posted = Arc::new(AtomicU64::new(0));
    let fired = Arc::new(AtomicU64::new(0));
    let oom = Arc::new(AtomicU64::new(0));

    // some busywork, n threads posting random delays
    for _ in 0..opt.producers {
        let opt = opt.clone();
        let q = q.clone();
        let posted = posted.clone();
        let fired = fired.clone();
        let oom = oom.clone();
        thread::spawn(move || {
            let mut rng = rand::thread_rng();
            loop {
                let delay = rng.gen_range(0..opt.delay);
                let fired = fired.clone();
                match q.call_in(delay, move || {
                    fired.fetch_add(1, Ordering::Relaxed);
                }) {
                    Ok(_) => {
                        posted.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(_) => {
                        oom.fetch_add(1, Ordering::Relaxed);
                        thread::sleep(Duration::from_millis(1));
                    }
                }
            }
        });
    }

    // report once a second
    {
        let posted = posted.clone();
        let fired = fired.clone();
        let oom = oom.clone();
        thread::spawn(move || {
            loop {
                thread::sleep(Duration::from_secs(1));
                println!(
                    "posted/s: {}, fired/s: {}, oom/s: {}",
                    posted.swap(0, Ordering::Relaxed),
                    fired.swap(0, Ordering::Relaxed),
                    oom.swap(0, Ordering::Relaxed),
                );
            }
        });
    }

    // one dispatch thread
    q.dispatch(-1);
}
