//! General utility code that didn't fit anywhere else
// (c) 2026 The muxrpc authors

mod logging;
pub use logging::{
    TimeFormat, is_initialized as tracing_is_initialised, setup as setup_tracing, trace_level,
};

#[cfg(test)]
pub(crate) mod test_protocol;
