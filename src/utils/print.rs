//! Helper macros for logging (console printing).

/// Log TRACE message, optionally with a parenthesized subsystem prefix.
#[macro_export]
macro_rules! pf_trace {
    ($prefix:expr; $fmt_str:literal $(, $fmt_arg:expr)*) => {
        log::trace!(concat!("({}) ", $fmt_str), $prefix $(, $fmt_arg)*)
    };

    ($fmt_str:literal $(, $fmt_arg:expr)*) => {
        log::trace!($fmt_str $(, $fmt_arg)*)
    };
}

/// Log DEBUG message, optionally with a parenthesized subsystem prefix.
#[macro_export]
macro_rules! pf_debug {
    ($prefix:expr; $fmt_str:literal $(, $fmt_arg:expr)*) => {
        log::debug!(concat!("({}) ", $fmt_str), $prefix $(, $fmt_arg)*)
    };

    ($fmt_str:literal $(, $fmt_arg:expr)*) => {
        log::debug!($fmt_str $(, $fmt_arg)*)
    };
}

/// Log INFO message, optionally with a parenthesized subsystem prefix.
#[macro_export]
macro_rules! pf_info {
    ($prefix:expr; $fmt_str:literal $(, $fmt_arg:expr)*) => {
        log::info!(concat!("({}) ", $fmt_str), $prefix $(, $fmt_arg)*)
    };

    ($fmt_str:literal $(, $fmt_arg:expr)*) => {
        log::info!($fmt_str $(, $fmt_arg)*)
    };
}

/// Log WARN message, optionally with a parenthesized subsystem prefix.
#[macro_export]
macro_rules! pf_warn {
    ($prefix:expr; $fmt_str:literal $(, $fmt_arg:expr)*) => {
        log::warn!(concat!("({}) ", $fmt_str), $prefix $(, $fmt_arg)*)
    };

    ($fmt_str:literal $(, $fmt_arg:expr)*) => {
        log::warn!($fmt_str $(, $fmt_arg)*)
    };
}

/// Log ERROR message, optionally with a parenthesized subsystem prefix.
#[macro_export]
macro_rules! pf_error {
    ($prefix:expr; $fmt_str:literal $(, $fmt_arg:expr)*) => {
        log::error!(concat!("({}) ", $fmt_str), $prefix $(, $fmt_arg)*)
    };

    ($fmt_str:literal $(, $fmt_arg:expr)*) => {
        log::error!($fmt_str $(, $fmt_arg)*)
    };
}

/// Log an error string to logger and then return a `SyncrepError::Msg`
/// containing the string.
#[macro_export]
macro_rules! logged_err {
    ($prefix:expr; $fmt_str:literal $(, $fmt_arg:expr)*) => {{
        pf_error!($prefix; $fmt_str $(, $fmt_arg)*);
        Err($crate::utils::SyncrepError::Msg(format!(
            concat!("({}) ", $fmt_str),
            $prefix $(, $fmt_arg)*
        )))
    }};

    ($fmt_str:literal $(, $fmt_arg:expr)*) => {{
        pf_error!($fmt_str $(, $fmt_arg)*);
        Err($crate::utils::SyncrepError::Msg(format!(
            $fmt_str $(, $fmt_arg)*
        )))
    }};
}
