
use evq::Evq;

fn main() {
    let q = Evq::new();

    let mut beats = 0u32;
    q.call_every(500, move || {
        beats += 1;
        println!("beat {}", beats);
    }).unwrap();

    q.call_in(5000, || {
        println!("done");
        q.break_dispatch();
    }).unwrap();

    q.dispatch(-1);
}
