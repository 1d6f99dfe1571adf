//! Compile-time defaults
//!
//! Generated by build.rs: library defaults merged with the file named by
//! `WEFT_CONFIG_RS` at build time, if any.

include!(concat!(env!("OUT_DIR"), "/weft_merged_config.rs"));
