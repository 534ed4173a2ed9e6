// Typed ledgers over the metadata database
//
// Every primitive runs on a caller-supplied connection so the engines can
// compose several of them inside one transaction. None of them takes locks;
// serializing access per fingerprint and per owner is the engines' job.
use crate::error::{CoreError, CoreResult};

pub mod index;
pub mod ownership;
pub mod quota;

pub(crate) fn to_db(value: u64) -> CoreResult<i64> {
    i64::try_from(value)
        .map_err(|_| CoreError::InvalidArgument(format!("value {} out of range", value)))
}

pub(crate) fn from_db(value: i64, column: &str) -> CoreResult<u64> {
    u64::try_from(value).map_err(|_| {
        CoreError::StorageUnavailable(format!("negative {} in metadata: {}", column, value))
    })
}
