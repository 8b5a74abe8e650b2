//! Before-images
//!
//! The value an item held before a transaction first mutated it, saved
//! ahead of the mutation so rollback can restore it. Images live in
//! their own table, one row per (transaction, request, item), with the
//! captured record serialized into a payload attribute.
//!
//! Image ids are derived from things the transaction record already
//! knows, so reading or deleting an image never needs a scan.

use keyspan_core::{
    AttrMap, AttrValue, Condition, ItemKey, ItemRecord, SharedStore, StoreError, TxError,
    TxResult, TxVersion,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Image table primary key: `"{tx_id}#{request_id}#{key digest}"`.
pub const ATTR_IMAGE_ID: &str = "_image_id";
/// Owning transaction, for operators digging through the table.
pub const ATTR_IMAGE_TX: &str = "_image_tx";
/// Owning request id.
pub const ATTR_IMAGE_REQUEST: &str = "_image_request";
/// Serialized [`ImagePayload`].
pub const ATTR_IMAGE_PAYLOAD: &str = "_image_payload";

/// What one image row stores: the item's key and its captured value.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ImagePayload {
    key: ItemKey,
    record: ItemRecord,
}

/// Before-image persistence for one image table.
#[derive(Clone)]
pub struct ItemImageStore {
    store: SharedStore,
    table: String,
}

impl ItemImageStore {
    /// Create an image store writing to `table`.
    pub fn new(store: SharedStore, table: impl Into<String>) -> Self {
        ItemImageStore {
            store,
            table: table.into(),
        }
    }

    /// Name of the image table.
    pub fn table(&self) -> &str {
        &self.table
    }

    fn image_key(&self, tv: &TxVersion, key: &ItemKey) -> ItemKey {
        ItemKey::single(
            &self.table,
            ATTR_IMAGE_ID,
            format!("{}#{}", tv, key.digest()),
        )
    }

    /// Save before-images for one request.
    ///
    /// Each image is written only if absent. A request retried after a
    /// partial failure re-captures current values, but by then the first
    /// attempt may already have applied its mutation; the write-if-absent
    /// guard keeps the original pre-transaction value in place.
    pub async fn add(
        &self,
        tv: &TxVersion,
        images: Vec<(ItemKey, ItemRecord)>,
    ) -> TxResult<()> {
        let writes = images.into_iter().map(|(key, record)| {
            let id = format!("{}#{}", tv, key.digest());
            let payload = ImagePayload { key, record };
            async move {
                let encoded = serde_json::to_string(&payload)
                    .map_err(|e| TxError::Assertion(format!("unencodable image: {}", e)))?;
                let mut row = AttrMap::new();
                row.insert(ATTR_IMAGE_ID.into(), AttrValue::Str(id));
                row.insert(
                    ATTR_IMAGE_TX.into(),
                    AttrValue::Str(tv.tx_id.as_str().into()),
                );
                row.insert(
                    ATTR_IMAGE_REQUEST.into(),
                    AttrValue::Int(i64::from(tv.request_id)),
                );
                row.insert(ATTR_IMAGE_PAYLOAD.into(), AttrValue::Str(encoded));
                match self
                    .store
                    .put_item(&self.table, row, Condition::item_not_exists())
                    .await
                {
                    Ok(()) => Ok(()),
                    // Already captured by an earlier attempt; keep it.
                    Err(StoreError::ConditionFailed(_)) => Ok(()),
                    Err(e) => Err(TxError::from(e)),
                }
            }
        });
        futures::future::try_join_all(writes).await?;
        Ok(())
    }

    /// Fetch the image one request saved for one item, if any.
    pub async fn get(&self, tv: &TxVersion, key: &ItemKey) -> TxResult<Option<ItemRecord>> {
        let image_key = self.image_key(tv, key);
        let row = match self.store.get_item(&image_key, true).await? {
            Some(row) => row,
            None => return Ok(None),
        };
        let encoded = row
            .get(ATTR_IMAGE_PAYLOAD)
            .and_then(AttrValue::as_str)
            .ok_or_else(|| {
                TxError::Assertion(format!("image {} has no payload", image_key))
            })?;
        let payload: ImagePayload = serde_json::from_str(encoded)
            .map_err(|e| TxError::Assertion(format!("corrupt image {}: {}", image_key, e)))?;
        Ok(Some(payload.record))
    }

    /// Delete every image a finished transaction saved.
    ///
    /// Runs after all locks are released, so a missing image just means
    /// an earlier completion pass got there first.
    pub async fn delete_all(&self, plan: &[(TxVersion, ItemKey)]) -> TxResult<()> {
        let deletes = plan.iter().map(|(tv, key)| {
            let image_key = self.image_key(tv, key);
            async move {
                self.store.delete_item(&image_key, Condition::none()).await?;
                Ok::<_, TxError>(())
            }
        });
        futures::future::try_join_all(deletes).await?;
        debug!(
            target: "keyspan::images",
            count = plan.len(),
            "deleted transaction before-images"
        );
        Ok(())
    }
}
