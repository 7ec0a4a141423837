//! Macros over [`performance`](crate::performance)
//!
//! Callers need `tracing` among their own dependencies.

/// Start a [`PerformanceSpan`](crate::performance::PerformanceSpan), with
/// optional structured fields. The duration is logged when it drops.
///
/// ```rust
/// use tessera_tracing::perf_span;
///
/// {
///     let _span = perf_span!("execute", replica = 0, arguments = 2);
///     // ... launch ...
/// }
/// ```
#[macro_export]
macro_rules! perf_span {
    ($name:expr) => {
        $crate::performance::PerformanceSpan::new($name, None)
    };
    ($name:expr, $($field:ident = $value:expr),+ $(,)?) => {
        $crate::performance::PerformanceSpan::from_span(
            $name,
            None,
            tracing::debug_span!(target: "tessera_perf", "perf", name = $name, $($field = $value),+),
        )
    };
}

/// One-off statistics event under the performance target.
///
/// ```rust
/// use tessera_tracing::perf_event;
///
/// perf_event!("h2d_batch", values = 8, threads = 4);
/// ```
#[macro_export]
macro_rules! perf_event {
    ($name:expr, $($field:ident = $value:expr),+ $(,)?) => {
        tracing::debug!(target: "tessera_perf", $($field = $value,)+ "{}", $name)
    };
}

#[cfg(test)]
mod tests {
    #[test]
    fn perf_span_forms() {
        let plain = perf_span!("make_tuple");
        assert_eq!(plain.name(), "make_tuple");
        let with_fields = perf_span!("execute", replica = 3, arguments = 2);
        assert_eq!(with_fields.name(), "execute");
    }

    #[test]
    fn perf_event_accepts_mixed_fields() {
        perf_event!("h2d_batch", values = 8, mode = "pool");
    }
}
