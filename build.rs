use std::env;
use std::path::Path;
use std::path::PathBuf;

fn main() {
    // override EVQ_SYS_PATH, this is how out-of-tree ports supply their own
    // clock/lock/semaphore layer
    println!("cargo:rerun-if-env-changed=EVQ_SYS_PATH");
    let mut sys_path = env::var_os("EVQ_SYS_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            if env::var_os("CARGO_FEATURE_LOOM").is_some() {
                PathBuf::from("sys/loom.rs")
            } else {
                PathBuf::from("sys/std.rs")
            }
        });
    // convert from crate relative, include! resolves relative to src/
    if sys_path.is_relative() {
        sys_path = Path::new("..").join(sys_path);
    }
    println!("cargo:rustc-env=EVQ_SYS_PATH={}", sys_path.display());

    // override EVQ_UTICK_WIDTH, the width of the tick counter, defaults to
    // u32 which is the cheap option on 32-bit MCUs
    println!("cargo:rerun-if-env-changed=EVQ_UTICK_WIDTH");
    let utick_width = env::var("EVQ_UTICK_WIDTH").unwrap_or_else(|_| "32".to_owned());
    match utick_width.as_str() {
        "32" | "64" => {}
        width => panic!("evq: unknown EVQ_UTICK_WIDTH {:?}?", width),
    }
    println!("cargo:rustc-check-cfg=cfg(evq_utick_width, values(\"32\", \"64\"))");
    println!("cargo:rustc-cfg=evq_utick_width=\"{}\"", utick_width);
}
