use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The closed set of code heap kinds.
///
/// The derived ordering is the order heaps are sorted in by the cache.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum CodeHeapKind {
    /// Stubs, adapters and other code that is not a compiled method.
    NonMethod,
    /// Methods compiled with profiling (tiers 2 and 3).
    MethodProfiled,
    /// Fully optimized and trivial methods (tiers 1 and 4).
    MethodNonProfiled,
    /// Single heap used when segmentation is disabled.
    Unified,
}

impl CodeHeapKind {
    pub const SEGMENTED: [CodeHeapKind; 3] = [
        CodeHeapKind::NonMethod,
        CodeHeapKind::MethodProfiled,
        CodeHeapKind::MethodNonProfiled,
    ];

    pub fn heap_name(self) -> &'static str {
        match self {
            Self::NonMethod => "CodeHeap 'non-methods'",
            Self::MethodProfiled => "CodeHeap 'profiled methods'",
            Self::MethodNonProfiled => "CodeHeap 'non-profiled methods'",
            Self::Unified => "CodeCache",
        }
    }

    /// Configuration key a user raises when this heap runs full.
    pub fn size_knob(self) -> &'static str {
        match self {
            Self::NonMethod => "non_method_size",
            Self::MethodProfiled => "profiled_size",
            Self::MethodNonProfiled => "non_profiled_size",
            Self::Unified => "reserved_size",
        }
    }

    pub fn accepts_methods(self) -> bool {
        !matches!(self, Self::NonMethod)
    }

    /// Whether a heap of this kind serves allocation requests for `requested`.
    pub fn accepts(self, requested: CodeHeapKind) -> bool {
        self == Self::Unified || self == requested
    }

    /// Next heap tried when this one cannot satisfy an allocation.
    ///
    /// `original` is the kind the caller asked for; the chain never leads back to it.
    pub fn fallback(self, original: CodeHeapKind) -> Option<CodeHeapKind> {
        let next = match self {
            Self::NonMethod => Self::MethodNonProfiled,
            Self::MethodNonProfiled => Self::MethodProfiled,
            Self::MethodProfiled if original == Self::MethodProfiled => Self::MethodNonProfiled,
            _ => return None,
        };
        (next != original).then_some(next)
    }

    /// Heap a method compiled at `tier` lives in.
    pub fn for_tier(tier: u8, segmented: bool) -> Self {
        if !segmented {
            return Self::Unified;
        }
        match tier {
            2 | 3 => Self::MethodProfiled,
            _ => Self::MethodNonProfiled,
        }
    }
}

impl fmt::Display for CodeHeapKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.heap_name())
    }
}

/// What a blob holds. Only used for accounting; contents are opaque.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlobKind {
    Method { has_dependencies: bool },
    Adapter,
    Stub,
}

impl BlobKind {
    pub fn is_method(self) -> bool {
        matches!(self, Self::Method { .. })
    }

    pub fn has_dependencies(self) -> bool {
        matches!(
            self,
            Self::Method {
                has_dependencies: true
            }
        )
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Method { .. } => "method",
            Self::Adapter => "adapter",
            Self::Stub => "stub",
        }
    }
}

/// Index of a heap inside the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HeapId(pub u8);

/// Typed handle to an allocated blob: owning heap plus byte offset from its low boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlobHandle {
    pub heap: HeapId,
    pub offset: u64,
}

impl BlobHandle {
    pub fn new(heap: HeapId, offset: usize) -> Self {
        Self {
            heap,
            offset: offset as u64,
        }
    }

    #[inline]
    pub fn offset(self) -> usize {
        self.offset as usize
    }
}

impl fmt::Display for BlobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "heap{}+{:#x}", self.heap.0, self.offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_chain_never_returns_to_origin() {
        use CodeHeapKind::*;
        assert_eq!(NonMethod.fallback(NonMethod), Some(MethodNonProfiled));
        assert_eq!(MethodNonProfiled.fallback(NonMethod), Some(MethodProfiled));
        assert_eq!(MethodProfiled.fallback(NonMethod), None);
        assert_eq!(MethodProfiled.fallback(MethodProfiled), Some(MethodNonProfiled));
        assert_eq!(MethodProfiled.fallback(MethodNonProfiled), None);
        assert_eq!(MethodNonProfiled.fallback(MethodProfiled), None);
        assert_eq!(MethodNonProfiled.fallback(MethodNonProfiled), Some(MethodProfiled));
        assert_eq!(Unified.fallback(Unified), None);
    }

    #[test]
    fn tier_mapping() {
        assert_eq!(CodeHeapKind::for_tier(3, true), CodeHeapKind::MethodProfiled);
        assert_eq!(CodeHeapKind::for_tier(4, true), CodeHeapKind::MethodNonProfiled);
        assert_eq!(CodeHeapKind::for_tier(1, true), CodeHeapKind::MethodNonProfiled);
        assert_eq!(CodeHeapKind::for_tier(3, false), CodeHeapKind::Unified);
    }

    #[test]
    fn unified_heap_accepts_everything() {
        for kind in CodeHeapKind::SEGMENTED {
            assert!(CodeHeapKind::Unified.accepts(kind));
        }
        assert!(!CodeHeapKind::NonMethod.accepts(CodeHeapKind::MethodProfiled));
    }
}
