//! Physical rowset access behind trait objects.
//!
//! The policy layer never touches bytes; it streams opaque chunks from a
//! reader into a writer and records the metadata the writer reports back.
//! `MemStore` backs the unit tests, `DirStore` keeps one blob file per
//! rowset under a directory.

use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;

use crate::{
    rowset::{RowsetId, RowsetMeta},
    tablet::{unix_now, TabletId},
    version::Version,
};

/// Opaque unit of row data moved between a reader and a writer.
#[derive(Clone, Debug)]
pub struct Chunk {
    pub num_rows: u64,
    pub data: Vec<u8>,
}

impl Chunk {
    pub fn new(num_rows: u64, data: Vec<u8>) -> Self {
        Self { num_rows, data }
    }
}

/// Everything a writer needs to place and label its output rowset.
#[derive(Clone, Debug)]
pub struct RowsetWriterContext {
    pub tablet_id: TabletId,
    pub partition_id: u64,
    pub rowset_id: RowsetId,
    pub version: Version,
    /// Overrides the store's default output location when set.
    pub path_prefix: Option<PathBuf>,
}

/// Stream of chunks read from one rowset.
pub type ChunkStream = BoxStream<'static, io::Result<Chunk>>;

/// Sink building one output rowset.
#[async_trait]
pub trait RowsetWriter: Send {
    async fn add_chunk(&mut self, chunk: Chunk) -> io::Result<()>;
    async fn flush(&mut self) -> io::Result<()>;
    /// Finish the rowset and report its meta.
    async fn build(self: Box<Self>) -> io::Result<RowsetMeta>;
}

/// Access to rowset payloads for merges and cleanup.
#[async_trait]
pub trait RowsetStore: Send + Sync + 'static {
    async fn open_reader(&self, meta: &RowsetMeta) -> io::Result<ChunkStream>;
    async fn create_writer(&self, ctx: RowsetWriterContext) -> io::Result<Box<dyn RowsetWriter>>;
    async fn delete_rowset(&self, id: RowsetId) -> io::Result<()>;
}

/// Heap-backed store. Rowsets without recorded chunks read back empty,
/// which lets policy-level tests ingest bare metas.
#[derive(Default)]
pub struct MemStore {
    chunks: Arc<Mutex<HashMap<RowsetId, Vec<Chunk>>>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the payload of an ingested rowset.
    pub fn put_chunks(&self, id: RowsetId, chunks: Vec<Chunk>) {
        self.chunks.lock().insert(id, chunks);
    }

    /// Stored payload of a rowset, empty if none was recorded.
    pub fn chunks_of(&self, id: RowsetId) -> Vec<Chunk> {
        self.chunks.lock().get(&id).cloned().unwrap_or_default()
    }

    /// Whether a payload is currently stored for `id`.
    pub fn contains(&self, id: RowsetId) -> bool {
        self.chunks.lock().contains_key(&id)
    }
}

#[async_trait]
impl RowsetStore for MemStore {
    async fn open_reader(&self, meta: &RowsetMeta) -> io::Result<ChunkStream> {
        let chunks = self.chunks_of(meta.id);
        Ok(Box::pin(stream::iter(chunks.into_iter().map(Ok))))
    }

    async fn create_writer(&self, ctx: RowsetWriterContext) -> io::Result<Box<dyn RowsetWriter>> {
        Ok(Box::new(MemWriter {
            store: self.chunks.clone(),
            ctx,
            staged: Vec::new(),
            segments: 0,
        }))
    }

    async fn delete_rowset(&self, id: RowsetId) -> io::Result<()> {
        self.chunks.lock().remove(&id);
        Ok(())
    }
}

struct MemWriter {
    store: Arc<Mutex<HashMap<RowsetId, Vec<Chunk>>>>,
    ctx: RowsetWriterContext,
    staged: Vec<Chunk>,
    segments: u32,
}

#[async_trait]
impl RowsetWriter for MemWriter {
    async fn add_chunk(&mut self, chunk: Chunk) -> io::Result<()> {
        self.staged.push(chunk);
        Ok(())
    }

    async fn flush(&mut self) -> io::Result<()> {
        self.segments += 1;
        Ok(())
    }

    async fn build(self: Box<Self>) -> io::Result<RowsetMeta> {
        let num_rows = self.staged.iter().map(|c| c.num_rows).sum();
        let data_disk_size = self.staged.iter().map(|c| c.data.len() as u64).sum();
        self.store.lock().insert(self.ctx.rowset_id, self.staged);
        Ok(RowsetMeta::data(
            self.ctx.rowset_id,
            self.ctx.version,
            num_rows,
            data_disk_size,
            self.segments.max(1),
            unix_now(),
        ))
    }
}

/// One length-prefixed blob file per rowset under a base directory.
pub struct DirStore {
    base: PathBuf,
}

impl DirStore {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    fn rowset_path(&self, prefix: Option<&Path>, id: RowsetId) -> PathBuf {
        prefix.unwrap_or(&self.base).join(format!("{id}.rsd"))
    }
}

#[async_trait]
impl RowsetStore for DirStore {
    async fn open_reader(&self, meta: &RowsetMeta) -> io::Result<ChunkStream> {
        let path = self.rowset_path(None, meta.id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err),
        };
        let chunks = decode_chunks(&bytes)?;
        Ok(Box::pin(stream::iter(chunks.into_iter().map(Ok))))
    }

    async fn create_writer(&self, ctx: RowsetWriterContext) -> io::Result<Box<dyn RowsetWriter>> {
        let path = self.rowset_path(ctx.path_prefix.as_deref(), ctx.rowset_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::File::create(&path).await?;
        Ok(Box::new(DirWriter {
            ctx,
            file,
            num_rows: 0,
            bytes: 0,
            segments: 0,
        }))
    }

    async fn delete_rowset(&self, id: RowsetId) -> io::Result<()> {
        match tokio::fs::remove_file(self.rowset_path(None, id)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }
}

struct DirWriter {
    ctx: RowsetWriterContext,
    file: tokio::fs::File,
    num_rows: u64,
    bytes: u64,
    segments: u32,
}

#[async_trait]
impl RowsetWriter for DirWriter {
    async fn add_chunk(&mut self, chunk: Chunk) -> io::Result<()> {
        self.file.write_all(&chunk.num_rows.to_le_bytes()).await?;
        self.file
            .write_all(&(chunk.data.len() as u64).to_le_bytes())
            .await?;
        self.file.write_all(&chunk.data).await?;
        self.num_rows += chunk.num_rows;
        self.bytes += 16 + chunk.data.len() as u64;
        Ok(())
    }

    async fn flush(&mut self) -> io::Result<()> {
        self.file.flush().await?;
        self.segments += 1;
        Ok(())
    }

    async fn build(mut self: Box<Self>) -> io::Result<RowsetMeta> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        Ok(RowsetMeta::data(
            self.ctx.rowset_id,
            self.ctx.version,
            self.num_rows,
            self.bytes,
            self.segments.max(1),
            unix_now(),
        ))
    }
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    u64::from_le_bytes(buf)
}

fn decode_chunks(bytes: &[u8]) -> io::Result<Vec<Chunk>> {
    let mut chunks = Vec::new();
    let mut offset = 0;
    while offset < bytes.len() {
        if bytes.len() - offset < 16 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "truncated chunk header",
            ));
        }
        let num_rows = read_u64(&bytes[offset..offset + 8]);
        let len = read_u64(&bytes[offset + 8..offset + 16]) as usize;
        offset += 16;
        if bytes.len() - offset < len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "truncated chunk payload",
            ));
        }
        chunks.push(Chunk::new(num_rows, bytes[offset..offset + len].to_vec()));
        offset += len;
    }
    Ok(chunks)
}
