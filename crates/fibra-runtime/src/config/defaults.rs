//! Compile-time defaults, generated by `build.rs`
//!
//! Override at build time with `FIBRA_CONFIG_RS=/path/to/fibra_config.rs`.

include!(concat!(env!("OUT_DIR"), "/fibra_defaults.rs"));
