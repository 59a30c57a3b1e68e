
// The sys layer provides the tick source, locking, and semaphore
// primitives. Which file backs it is decided at build time, see build.rs,
// so ports can point EVQ_SYS_PATH at their own implementation.
include!(env!("EVQ_SYS_PATH"));
