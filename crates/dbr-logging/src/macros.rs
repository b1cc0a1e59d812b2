//! ---
//! dbr_section: "03-persistence-logging"
//! dbr_subsection: "module"
//! dbr_type: "source"
//! dbr_scope: "code"
//! dbr_description: "Structured logging adapters and lifecycle events."
//! dbr_version: "v0.0.0-prealpha"
//! dbr_owner: "tbd"
//! ---
#[doc(hidden)]
#[macro_export]
macro_rules! __dbr_event {
    ($level:expr, $ctx:expr, $($arg:tt)+) => {{
        let ctx = &$ctx;
        tracing::event!(
            $level,
            cluster = ctx.cluster.unwrap_or(""),
            node = ctx.node.unwrap_or(""),
            phase = ctx.phase.unwrap_or(""),
            namespace = ctx.namespace.unwrap_or(""),
            message = %format_args!($($arg)+)
        );
    }};
}

/// Emit an informational log enriched with Data Broker context.
#[macro_export]
macro_rules! dbr_info {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__dbr_event!(tracing::Level::INFO, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__dbr_event!(tracing::Level::INFO, $crate::LogContext::default(), $($arg)+)
    };
}

/// Emit a debug log enriched with Data Broker context.
#[macro_export]
macro_rules! dbr_debug {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__dbr_event!(tracing::Level::DEBUG, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__dbr_event!(tracing::Level::DEBUG, $crate::LogContext::default(), $($arg)+)
    };
}

/// Emit a warning enriched with Data Broker context.
#[macro_export]
macro_rules! dbr_warn {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__dbr_event!(tracing::Level::WARN, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__dbr_event!(tracing::Level::WARN, $crate::LogContext::default(), $($arg)+)
    };
}

/// Emit an error log enriched with Data Broker context.
#[macro_export]
macro_rules! dbr_error {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__dbr_event!(tracing::Level::ERROR, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__dbr_event!(tracing::Level::ERROR, $crate::LogContext::default(), $($arg)+)
    };
}
