//! Bounds for RSS marshaling. Everything is checked before the driver sees it.

use crate::api::Result;
use crate::driver::RssParams;
use crate::errors::Error;

pub const MAX_RSS_QUEUES: u16 = 16;
pub const MAX_IND_TABLE_LEN: usize = 128;
pub const MAX_KEY_LEN: usize = 40;

fn bounded(what: &'static str, len: usize, max: usize) -> Result<()> {
    if len > max {
        return Err(Error::LimitExceeded { what, len, max });
    }
    Ok(())
}

pub(crate) fn check_key(key: &[u8]) -> Result<()> {
    bounded("rss hash key", key.len(), MAX_KEY_LEN)
}

pub(crate) fn check_table(table: &[u8]) -> Result<()> {
    bounded("rss indirection table", table.len(), MAX_IND_TABLE_LEN)
}

/// Rejects parameters the host could not marshal.
pub(crate) fn check_params(params: &RssParams) -> Result<()> {
    bounded(
        "rss queue count",
        params.num_queues as usize,
        MAX_RSS_QUEUES as usize,
    )?;
    bounded("rss hash key", params.key_len as usize, MAX_KEY_LEN)?;
    bounded(
        "rss indirection table",
        params.table_len as usize,
        MAX_IND_TABLE_LEN,
    )
}
