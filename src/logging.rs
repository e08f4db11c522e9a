//! Structured logging for compaction events.
//!
//! Every event this crate emits is about one tablet, so the macro takes
//! the tablet id as its own argument and renders a uniform
//! `tablet=<id> event=<name>` prefix that a log pipeline can key on.

pub(crate) const LOG_TARGET: &str = "strata::compaction";

macro_rules! tablet_event {
    ($level:expr, $tablet:expr, $event:expr, $fmt:literal $(, $args:expr)* $(,)?) => {{
        if log::log_enabled!(target: crate::logging::LOG_TARGET, $level) {
            log::log!(
                target: crate::logging::LOG_TARGET,
                $level,
                concat!("tablet={} event={} ", $fmt),
                $tablet,
                $event
                $(, $args)*
            );
        }
    }};
}

pub(crate) use tablet_event;
