//! No-op stand-ins for the `tracing` macros used by this crate when the
//! `tracing` feature is disabled.

#[allow(unused_macros)]
macro_rules! trace {
    (target: $target:expr, $($arg:tt)+ ) => {};
    ($($arg:tt)+) => {};
}

#[allow(unused_macros)]
macro_rules! debug {
    (target: $target:expr, $($arg:tt)+ ) => {};
    ($($arg:tt)+) => {};
}

#[allow(unused_macros)]
macro_rules! warn {
    (target: $target:expr, $($arg:tt)+ ) => {};
    ($($arg:tt)+) => {};
}
