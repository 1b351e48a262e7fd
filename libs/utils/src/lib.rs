//! `utils` is intended to be a place to put code that is shared
//! between other crates in this repository.

// retry loops with fixed or exponential delays
pub mod backoff;

// extensions to `std::fs`
pub mod fs_ext;

// common log initialisation routine
pub mod logging;

// advisory lock held for the duration of a mutating command
pub mod lock_file;
