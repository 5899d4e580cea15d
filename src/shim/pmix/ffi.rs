//! Declarations of the PMIx tool interface, generated at build time from `pmix_tool.h`.

#![allow(
    non_upper_case_globals,
    non_camel_case_types,
    non_snake_case,
    dead_code,
    improper_ctypes,
    clippy::all
)]

include!(concat!(env!("OUT_DIR"), "/pmix.rs"));
