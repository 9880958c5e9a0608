use rayon::prelude::*;

use crate::{
    chunk_source::ChunkId,
    error::{Error, Result},
};

const MAGIC: &[u8; 4] = b"DCVI";
const FORMAT_VERSION: u32 = 2;
/// Fixed part of the header; the model id bytes follow it.
const HEADER_LEN: usize = 4 + 4 + 4 + 8 + 4;

/// One search result.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub position: usize,
    pub chunk_id: ChunkId,
    pub score: f32,
}

/// Append-only exact inner-product index.
///
/// Vectors are stored contiguously, one row of `dimension` floats per
/// position, with the owning chunk id kept in a parallel list. Positions are
/// never reused; removing data means building a new index.
///
/// The index remembers which embedder produced its vectors, so vectors from
/// one model are never ranked against queries from another.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorIndex {
    model_id: String,
    dimension: usize,
    vectors: Vec<f32>,
    chunk_ids: Vec<ChunkId>,
}

impl VectorIndex {
    pub fn new(model_id: &str, dimension: usize) -> Self {
        Self {
            model_id: model_id.to_string(),
            dimension,
            vectors: Vec::new(),
            chunk_ids: Vec::new(),
        }
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Whether `chunk_id` has a vector in this index.
    pub fn contains(&self, chunk_id: ChunkId) -> bool {
        self.chunk_ids.contains(&chunk_id)
    }

    /// Iterate the chunk ids in position order.
    pub fn chunk_ids(&self) -> impl Iterator<Item = ChunkId> + '_ {
        self.chunk_ids.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.chunk_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunk_ids.is_empty()
    }

    pub fn chunk_id(&self, position: usize) -> Option<ChunkId> {
        self.chunk_ids.get(position).copied()
    }

    /// Append a vector and return its position.
    ///
    /// A vector of the wrong length is rejected without touching the index.
    pub fn insert(&mut self, chunk_id: ChunkId, vector: &[f32]) -> Result<usize> {
        if vector.len() != self.dimension {
            return Err(Error::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }

        let position = self.chunk_ids.len();
        self.vectors.extend_from_slice(vector);
        self.chunk_ids.push(chunk_id);
        Ok(position)
    }

    /// Top `k` positions by descending inner product with `query`.
    ///
    /// Ties go to the earlier position. An empty index yields no results.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>> {
        if query.len() != self.dimension {
            return Err(Error::DimensionMismatch {
                expected: self.dimension,
                actual: query.len(),
            });
        }
        if k == 0 || self.is_empty() || self.dimension == 0 {
            return Ok(Vec::new());
        }

        let mut scored: Vec<(usize, f32)> = self
            .vectors
            .par_chunks_exact(self.dimension)
            .enumerate()
            .map(|(position, row)| (position, dot(row, query)))
            .collect();

        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(position, score)| Neighbor {
                position,
                chunk_id: self.chunk_ids[position],
                score,
            })
            .collect())
    }

    /// Serialize to the on-disk blob format.
    ///
    /// Layout (little endian): magic `DCVI`, u32 version, u32 dimension,
    /// u64 count, u32 model id length, the UTF-8 model id, `count` u64 chunk
    /// ids, `count * dimension` f32 values.
    pub fn to_bytes(&self) -> Vec<u8> {
        let model = self.model_id.as_bytes();
        let mut buf = Vec::with_capacity(
            HEADER_LEN + model.len() + self.chunk_ids.len() * 8 + self.vectors.len() * 4,
        );
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        buf.extend_from_slice(&(self.dimension as u32).to_le_bytes());
        buf.extend_from_slice(&(self.chunk_ids.len() as u64).to_le_bytes());
        buf.extend_from_slice(&(model.len() as u32).to_le_bytes());
        buf.extend_from_slice(model);

        if cfg!(target_endian = "little") {
            buf.extend_from_slice(bytemuck::cast_slice(&self.chunk_ids));
            buf.extend_from_slice(bytemuck::cast_slice(&self.vectors));
        } else {
            for id in &self.chunk_ids {
                buf.extend_from_slice(&id.to_le_bytes());
            }
            for x in &self.vectors {
                buf.extend_from_slice(&x.to_le_bytes());
            }
        }
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::CorruptIndex(format!(
                "blob is {} bytes, shorter than the header",
                bytes.len()
            )));
        }
        if &bytes[0..4] != MAGIC {
            return Err(Error::CorruptIndex("bad magic".to_string()));
        }

        let version = read_u32(&bytes[4..8]);
        if version != FORMAT_VERSION {
            return Err(Error::CorruptIndex(format!(
                "unsupported format version {version}"
            )));
        }

        let dimension = read_u32(&bytes[8..12]) as usize;
        let count = usize::try_from(read_u64(&bytes[12..20])).map_err(|_| {
            Error::CorruptIndex("vector count does not fit in memory".to_string())
        })?;
        if dimension == 0 {
            return Err(Error::CorruptIndex("zero dimension".to_string()));
        }

        let model_len = read_u32(&bytes[20..24]) as usize;
        let body_start = HEADER_LEN
            .checked_add(model_len)
            .filter(|&end| end <= bytes.len())
            .ok_or_else(|| Error::CorruptIndex("model id runs past the end".to_string()))?;
        let model_id = std::str::from_utf8(&bytes[HEADER_LEN..body_start])
            .map_err(|_| Error::CorruptIndex("model id is not UTF-8".to_string()))?
            .to_string();

        let ids_len = count.checked_mul(8);
        let vectors_len = count
            .checked_mul(dimension)
            .and_then(|n| n.checked_mul(4));
        let expected = ids_len
            .zip(vectors_len)
            .and_then(|(a, b)| a.checked_add(b))
            .and_then(|body| body.checked_add(body_start));
        if expected != Some(bytes.len()) {
            return Err(Error::CorruptIndex(format!(
                "blob is {} bytes, header describes {count} vectors of dimension {dimension}",
                bytes.len()
            )));
        }

        let ids_end = body_start + count * 8;
        let chunk_ids = bytes[body_start..ids_end]
            .chunks_exact(8)
            .map(read_u64)
            .collect();
        let vectors = bytes[ids_end..]
            .chunks_exact(4)
            .map(|word| f32::from_le_bytes([word[0], word[1], word[2], word[3]]))
            .collect();

        Ok(Self {
            model_id,
            dimension,
            vectors,
            chunk_ids,
        })
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(word)
}
