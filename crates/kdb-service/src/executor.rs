use crate::protocol::{TransactionDescriptor, TxMode, TxRequest, TxSelector};
use crate::{StorageError, StorageService};
use async_trait::async_trait;
use kdb_common::{
    block_kind, BlockDescriptor, BlockKind, DataBlock, DescriptorTag, PAYLOAD_LEN,
};
use kdb_store::{block_offset, BlockStore};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Where one live object sits in the file.
#[derive(Debug, Clone)]
struct Extent {
    descriptor_offset: u64,
    descriptor: BlockDescriptor,
    /// Page number -> block offset.
    pages: BTreeMap<u64, u64>,
}

/// fileId -> extent, for every allocated or closed object.
#[derive(Debug, Default)]
struct ExtentMap {
    live: HashMap<String, Extent>,
}

impl ExtentMap {
    /// Rebuilds the map from blocks 1..n.
    ///
    /// Allocation is append-only, so an object's pages always follow its
    /// descriptor. A later descriptor for the same fileId starts a new
    /// incarnation and hides the pages of the earlier one.
    fn scan(store: &BlockStore) -> Result<Self, StorageError> {
        let mut all: HashMap<String, Extent> = HashMap::new();
        let count = store.block_count()?;

        for n in 1..count {
            let offset = block_offset(n);
            let block = store.read_full_block(offset)?;

            match block_kind(&block) {
                BlockKind::Descriptor(_) => {
                    let descriptor =
                        BlockDescriptor::decode(&block).ok_or(StorageError::Corrupt(offset))?;
                    all.insert(
                        descriptor.file_id.clone(),
                        Extent {
                            descriptor_offset: offset,
                            descriptor,
                            pages: BTreeMap::new(),
                        },
                    );
                }
                BlockKind::Data => {
                    let page = DataBlock::decode(&block).ok_or(StorageError::Corrupt(offset))?;
                    match all.get_mut(&page.file_id) {
                        Some(extent) => {
                            extent.pages.insert(page.block_number, offset);
                        }
                        None => debug!(offset, file_id = %page.file_id, "orphan data block"),
                    }
                }
                BlockKind::Unknown(tag) => {
                    warn!(offset, tag, "skipping unrecognized block");
                }
            }
        }

        all.retain(|_, extent| extent.descriptor.tag != DescriptorTag::Deleted);
        info!(objects = all.len(), blocks = count, "extent map rebuilt");
        Ok(Self { live: all })
    }
}

/// Storage service that keeps objects as descriptor + data blocks.
pub struct BlockStorageService {
    next_tx_id: AtomicU64,
    extents: Mutex<Option<ExtentMap>>,
}

impl BlockStorageService {
    pub fn new() -> Self {
        Self {
            next_tx_id: AtomicU64::new(1),
            extents: Mutex::new(None),
        }
    }

    fn lock_extents(&self) -> Result<MutexGuard<'_, Option<ExtentMap>>, StorageError> {
        self.extents.lock().map_err(|_| StorageError::Lock)
    }

    fn apply(
        map: &mut ExtentMap,
        store: &mut BlockStore,
        selector: &TxSelector,
        data: &[u8],
    ) -> Result<Vec<u8>, StorageError> {
        match selector.mode {
            TxMode::Write => Self::write(map, store, selector, data).map(|_| Vec::new()),
            TxMode::Read => Self::read(map, store, selector),
            TxMode::Close => {
                Self::retag(map, store, &selector.file_id, DescriptorTag::Closed).map(|_| Vec::new())
            }
            TxMode::Delete => {
                Self::retag(map, store, &selector.file_id, DescriptorTag::Deleted)?;
                map.live.remove(&selector.file_id);
                Ok(Vec::new())
            }
        }
    }

    fn write(
        map: &mut ExtentMap,
        store: &mut BlockStore,
        selector: &TxSelector,
        data: &[u8],
    ) -> Result<(), StorageError> {
        let file_id = &selector.file_id;

        if !map.live.contains_key(file_id) {
            let descriptor = BlockDescriptor::new(file_id.clone(), selector.file_name.clone());
            let descriptor_offset = store.append_block(&descriptor.encode()?)?;
            debug!(%file_id, descriptor_offset, "object allocated");
            map.live.insert(
                file_id.clone(),
                Extent {
                    descriptor_offset,
                    descriptor,
                    pages: BTreeMap::new(),
                },
            );
        }

        let extent = map
            .live
            .get_mut(file_id)
            .ok_or_else(|| StorageError::NotFound(file_id.clone()))?;
        if extent.descriptor.tag == DescriptorTag::Closed {
            return Err(StorageError::Closed(file_id.clone()));
        }

        let start = selector.offset;
        let end = start + data.len() as u64;
        let mut pos = start;

        while pos < end {
            let page_no = pos / PAYLOAD_LEN as u64;
            let within = (pos % PAYLOAD_LEN as u64) as usize;
            let take = (PAYLOAD_LEN - within).min((end - pos) as usize);
            let src = (pos - start) as usize;

            let existing = extent.pages.get(&page_no).copied();
            let mut page = match existing {
                Some(offset) => DataBlock::decode(&store.read_full_block(offset)?)
                    .ok_or(StorageError::Corrupt(offset))?,
                None => DataBlock::new(file_id.clone(), page_no),
            };

            page.payload[within..within + take].copy_from_slice(&data[src..src + take]);
            page.used = page.used.max((within + take) as u16);

            let encoded = page.encode()?;
            match existing {
                Some(offset) => store.write_block(offset, &encoded)?,
                None => {
                    let offset = store.append_block(&encoded)?;
                    extent.pages.insert(page_no, offset);
                }
            }

            pos += take as u64;
        }

        extent.descriptor.file_size = extent.descriptor.file_size.max(end);
        store.write_block(extent.descriptor_offset, &extent.descriptor.encode()?)?;
        store.sync()?;
        Ok(())
    }

    fn read(
        map: &ExtentMap,
        store: &BlockStore,
        selector: &TxSelector,
    ) -> Result<Vec<u8>, StorageError> {
        let extent = map
            .live
            .get(&selector.file_id)
            .ok_or_else(|| StorageError::NotFound(selector.file_id.clone()))?;

        let size = extent.descriptor.file_size;
        if selector.offset >= size {
            return Ok(Vec::new());
        }
        let start = selector.offset;
        let end = size.min(start.saturating_add(selector.length));

        let mut out = vec![0u8; (end - start) as usize];
        let mut pos = start;
        while pos < end {
            let page_no = pos / PAYLOAD_LEN as u64;
            let within = (pos % PAYLOAD_LEN as u64) as usize;
            let take = (PAYLOAD_LEN - within).min((end - pos) as usize);
            let dst = (pos - start) as usize;

            // Pages never written read as zeros
            if let Some(&offset) = extent.pages.get(&page_no) {
                let page = DataBlock::decode(&store.read_full_block(offset)?)
                    .ok_or(StorageError::Corrupt(offset))?;
                out[dst..dst + take].copy_from_slice(&page.payload[within..within + take]);
            }

            pos += take as u64;
        }
        Ok(out)
    }

    fn retag(
        map: &mut ExtentMap,
        store: &mut BlockStore,
        file_id: &str,
        tag: DescriptorTag,
    ) -> Result<(), StorageError> {
        let extent = map
            .live
            .get_mut(file_id)
            .ok_or_else(|| StorageError::NotFound(file_id.to_string()))?;

        if extent.descriptor.tag != tag {
            extent.descriptor.tag = tag;
            store.write_block(extent.descriptor_offset, &extent.descriptor.encode()?)?;
            store.sync()?;
            debug!(%file_id, ?tag, "object retagged");
        }
        Ok(())
    }
}

impl Default for BlockStorageService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageService for BlockStorageService {
    fn name(&self) -> &'static str {
        "block"
    }

    fn generate_tx(
        &self,
        payload: &[u8],
        mode: TxMode,
    ) -> Result<TransactionDescriptor, StorageError> {
        let request = TxRequest::decode(payload)?;
        let id = self.next_tx_id.fetch_add(1, Ordering::Relaxed);
        TransactionDescriptor::build(id, request, mode)
    }

    fn execute_tx(
        &self,
        store: &mut BlockStore,
        tx: &TransactionDescriptor,
    ) -> Result<Vec<u8>, StorageError> {
        if store.block_count()? == 0 {
            return Err(StorageError::Uninitialized);
        }
        let selector = tx.selector()?;

        let mut guard = self.lock_extents()?;
        if guard.is_none() {
            *guard = Some(ExtentMap::scan(store)?);
        }
        let map = guard.as_mut().ok_or(StorageError::Lock)?;

        let result = Self::apply(map, store, &selector, &tx.data);
        if let Err(StorageError::Io(e)) = &result {
            // Disk and map may disagree now; rebuild on the next transaction
            warn!(tx_id = tx.id, error = %e, "dropping extent map after IO failure");
            *guard = None;
        }
        result
    }
}
