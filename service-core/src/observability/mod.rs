pub mod logging;

pub use logging::{init_tracing, try_init_tracing};
