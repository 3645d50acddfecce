//! Callstack interning
//!
//! Raw instruction-pointer stacks are hashed into a [`CallstackId`] and
//! stored once. Each raw stack also gets a resolved twin whose frames are
//! replaced by the virtual address of the containing catalog function, and
//! every resolved function address remembers which raw stacks reach it.
//!
//! One mutex guards all four maps so readers never see a raw stack without
//! its resolved counterpart. It is separate from the catalog lock because
//! the sampling hot path writes here far more often.

use crate::catalog::FunctionCatalog;
use crate::domain::{CallstackId, Tid, TransportError};
use crate::hashing::words_hash;
use crate::transport::frame::WireReader;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

/// Ordered instruction pointers, leaf first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallStack {
    pub frames: Vec<u64>,
    /// Sampled thread for raw stacks, `None` for resolved ones
    pub tid: Option<Tid>,
    id: CallstackId,
}

impl CallStack {
    #[must_use]
    pub fn new(frames: Vec<u64>, tid: Tid) -> Self {
        let id = CallstackId(words_hash(&frames));
        Self { frames, tid: Some(tid), id }
    }

    #[must_use]
    pub fn resolved(frames: Vec<u64>) -> Self {
        let id = CallstackId(words_hash(&frames));
        Self { frames, tid: None, id }
    }

    /// Content hash over the ordered frames
    #[must_use]
    pub fn id(&self) -> CallstackId {
        self.id
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    #[must_use]
    pub fn leaf(&self) -> Option<u64> {
        self.frames.first().copied()
    }

    /// `tid u32 | depth u32 | frames u64 * depth`
    #[must_use]
    pub fn to_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.frames.len() * 8);
        out.extend_from_slice(&self.tid.map_or(0, |t| t.0).to_le_bytes());
        #[allow(clippy::cast_possible_truncation)]
        out.extend_from_slice(&(self.frames.len() as u32).to_le_bytes());
        for frame in &self.frames {
            out.extend_from_slice(&frame.to_le_bytes());
        }
        out
    }

    /// # Errors
    /// Returns [`TransportError::Truncated`] when the payload is shorter than its depth claims.
    pub fn from_payload(bytes: &[u8]) -> Result<Self, TransportError> {
        let mut reader = WireReader::new(bytes);
        let tid = Tid(reader.u32()?);
        let depth = reader.u32()? as usize;
        if reader.remaining() < depth * 8 {
            return Err(TransportError::Truncated { expected: 8 + depth * 8, actual: bytes.len() });
        }
        let frames = (0..depth).map(|_| reader.u64()).collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(frames, tid))
    }
}

/// One sample: which stack, on which thread, when
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallstackEvent {
    pub time: u64,
    pub callstack_id: CallstackId,
    pub tid: Tid,
}

impl CallstackEvent {
    pub const WIRE_SIZE: usize = 24;

    /// `hash u64 | tid u32 | pad u32 | time u64`
    #[must_use]
    pub fn to_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::WIRE_SIZE);
        out.extend_from_slice(&self.callstack_id.0.to_le_bytes());
        out.extend_from_slice(&self.tid.0.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&self.time.to_le_bytes());
        out
    }

    /// # Errors
    /// Returns [`TransportError::Truncated`] on short payloads.
    pub fn from_payload(bytes: &[u8]) -> Result<Self, TransportError> {
        let mut reader = WireReader::new(bytes);
        let callstack_id = CallstackId(reader.u64()?);
        let tid = Tid(reader.u32()?);
        reader.u32()?;
        let time = reader.u64()?;
        Ok(Self { time, callstack_id, tid })
    }
}

#[derive(Default)]
struct InternerMaps {
    raw: HashMap<CallstackId, CallStack>,
    resolved: HashMap<CallstackId, CallStack>,
    raw_to_resolved: HashMap<CallstackId, CallstackId>,
    function_to_raw: HashMap<u64, HashSet<CallstackId>>,
}

#[derive(Default)]
pub struct CallstackInterner {
    maps: Mutex<InternerMaps>,
}

impl CallstackInterner {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `stack` if unseen and return its id
    ///
    /// Frames are resolved against `catalog` before the lock is taken, so
    /// the catalog lock is never held together with this one. Frames outside
    /// every known function resolve to themselves.
    pub fn intern(&self, stack: CallStack, catalog: &FunctionCatalog) -> CallstackId {
        let id = stack.id();
        if self.maps.lock().raw.contains_key(&id) {
            return id;
        }

        let resolved = CallStack::resolved(
            stack.frames.iter().map(|ip| catalog.containing_address(*ip).unwrap_or(*ip)).collect(),
        );
        let resolved_id = resolved.id();

        let mut maps = self.maps.lock();
        if maps.raw.contains_key(&id) {
            return id;
        }
        for function in &resolved.frames {
            maps.function_to_raw.entry(*function).or_default().insert(id);
        }
        maps.resolved.entry(resolved_id).or_insert(resolved);
        maps.raw_to_resolved.insert(id, resolved_id);
        maps.raw.insert(id, stack);
        id
    }

    #[must_use]
    pub fn get_raw(&self, id: CallstackId) -> Option<CallStack> {
        self.maps.lock().raw.get(&id).cloned()
    }

    /// Resolved counterpart of a raw stack
    #[must_use]
    pub fn get_resolved(&self, raw: CallstackId) -> Option<CallStack> {
        let maps = self.maps.lock();
        let resolved = maps.raw_to_resolved.get(&raw)?;
        maps.resolved.get(resolved).cloned()
    }

    #[must_use]
    pub fn resolved_id(&self, raw: CallstackId) -> Option<CallstackId> {
        self.maps.lock().raw_to_resolved.get(&raw).copied()
    }

    /// Raw stacks that pass through the function at `function_vaddr`
    #[must_use]
    pub fn stacks_reaching(&self, function_vaddr: u64) -> Vec<CallstackId> {
        let mut ids: Vec<CallstackId> = self
            .maps
            .lock()
            .function_to_raw
            .get(&function_vaddr)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.maps.lock().raw.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn resolved_len(&self) -> usize {
        self.maps.lock().resolved.len()
    }

    pub fn clear(&self) {
        *self.maps.lock() = InternerMaps::default();
    }
}
