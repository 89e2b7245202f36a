//! Logging macros that forward to the `log` crate when the `log` feature is
//! enabled and compile to nothing otherwise.

macro_rules! log_or_discard {
    ($level:ident, $($arg:tt)+) => {{
        #[cfg(feature = "log")]
        ::log::$level!($($arg)+);
        #[cfg(not(feature = "log"))]
        {
            let _ = format_args!($($arg)+);
        }
    }};
}

#[allow(unused_macros)]
macro_rules! trace {
    ($($arg:tt)+) => { log_or_discard!(trace, $($arg)+) };
}

#[allow(unused_macros)]
macro_rules! debug {
    ($($arg:tt)+) => { log_or_discard!(debug, $($arg)+) };
}

#[allow(unused_macros)]
macro_rules! info {
    ($($arg:tt)+) => { log_or_discard!(info, $($arg)+) };
}

#[allow(unused_macros)]
macro_rules! warn {
    ($($arg:tt)+) => { log_or_discard!(warn, $($arg)+) };
}

#[allow(unused_macros)]
macro_rules! error {
    ($($arg:tt)+) => { log_or_discard!(error, $($arg)+) };
}
