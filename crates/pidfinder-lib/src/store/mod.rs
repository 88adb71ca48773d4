//! Deduplicated record of observed containers and its on-disk form

mod known_set;
mod persistence;

pub use known_set::KnownSet;
pub use persistence::{
    decode, encode, CsvStore, Decoded, RetryPolicy, StoreError, COLUMNS, DEFAULT_FILE_NAME,
};

pub(crate) use persistence::write_atomic;
