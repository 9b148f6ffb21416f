//! Claim protocol: acquire a batch before delivering.
//!
//! # フロー
//! 1. `count_owned_by(owner)` で前回の sweep から持ち越した claim を数える
//! 2. `batch_size` に満たなければ `claim_unowned` で不足分だけ補充
//! 3. `fetch_owned_by(owner, batch_size)` をこの sweep のバッチとして返す
//!
//! Steps 1 and 2 are separate round-trips. Another worker may claim the same
//! candidates in between; that is harmless because `claim_unowned` only takes
//! messages that are still unowned at the moment of its own atomic update.
//! Carried-over claims (e.g. from a crashed previous run of the same identity)
//! are reused, never claimed twice.

use tracing::debug;

use crate::domain::{MessageRecord, StoreError, WorkerId};
use crate::ports::MessageStore;

pub async fn claim_batch(
    store: &dyn MessageStore,
    owner: &WorkerId,
    batch_size: usize,
) -> Result<Vec<MessageRecord>, StoreError> {
    let already = store.count_owned_by(owner).await?;

    let topped_up = if already < batch_size {
        store.claim_unowned(owner, batch_size - already).await?.len()
    } else {
        0
    };

    let batch = store.fetch_owned_by(owner, batch_size).await?;
    debug!(
        worker = %owner,
        carried_over = already,
        claimed = topped_up,
        batch = batch.len(),
        "claimed batch"
    );
    Ok(batch)
}
