use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::CodeCacheConfig;
use crate::error::{CodeCacheError, Result};
use crate::types::CodeHeapKind;
use crate::units::{align_down, align_up};

/// Order heaps are laid out in inside the reservation, lowest address first.
const ADDRESS_ORDER: [CodeHeapKind; 4] = [
    CodeHeapKind::MethodProfiled,
    CodeHeapKind::NonMethod,
    CodeHeapKind::MethodNonProfiled,
    CodeHeapKind::Unified,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeapSpec {
    pub kind: CodeHeapKind,
    pub size: usize,
}

/// A heap's position inside the reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeapPlacement {
    pub kind: CodeHeapKind,
    pub offset: usize,
    pub size: usize,
}

/// Result of partitioning: the final reservation and the heaps carved out of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeapLayout {
    pub reserved_size: usize,
    pub granularity: usize,
    pub segmented: bool,
    /// Heaps in kind order.
    pub heaps: Vec<HeapSpec>,
}

impl HeapLayout {
    pub fn size_of(&self, kind: CodeHeapKind) -> Option<usize> {
        self.heaps.iter().find(|h| h.kind == kind).map(|h| h.size)
    }

    pub fn total(&self) -> usize {
        self.heaps.iter().map(|h| h.size).sum()
    }

    /// Heaps with their offsets, in address order.
    pub fn placements(&self) -> Vec<HeapPlacement> {
        let mut offset = 0;
        ADDRESS_ORDER
            .iter()
            .filter_map(|kind| self.heaps.iter().find(|h| h.kind == *kind))
            .map(|spec| {
                let placement = HeapPlacement {
                    kind: spec.kind,
                    offset,
                    size: spec.size,
                };
                offset += spec.size;
                placement
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy)]
struct Budget {
    size: usize,
    set: bool,
    enabled: bool,
}

impl Budget {
    fn from_override(value: Option<usize>, enabled: bool) -> Self {
        Self {
            size: value.unwrap_or(0),
            set: value.is_some(),
            enabled,
        }
    }
}

fn size_of_unset(available: usize, used: usize, min: usize) -> usize {
    if available > used + min {
        available - used
    } else {
        min
    }
}

/// Compute heap sizes for `config`.
///
/// Deterministic: the same configuration always yields the same layout. Fails with
/// [`CodeCacheError::HeapBelowMinimum`] or [`CodeCacheError::InvalidHeapSizes`], both of
/// which are fatal at startup.
pub fn initialize_heaps(config: &CodeCacheConfig) -> Result<HeapLayout> {
    let granularity = config.granularity();
    let (total, pinned) = config.total_size();

    if !config.segmented {
        if total < config.minimum_use_space {
            return Err(CodeCacheError::HeapBelowMinimum {
                heap: CodeHeapKind::Unified.heap_name(),
                size: total,
                required: config.minimum_use_space,
            });
        }
        let size = align_up(total, granularity);
        debug!("Unified code cache of {}K", size / 1024);
        return Ok(HeapLayout {
            reserved_size: size,
            granularity,
            segmented: false,
            heaps: vec![HeapSpec {
                kind: CodeHeapKind::Unified,
                size,
            }],
        });
    }

    if pinned && total < config.minimum_use_space {
        return Err(CodeCacheError::HeapBelowMinimum {
            heap: CodeHeapKind::Unified.heap_name(),
            size: total,
            required: config.minimum_use_space,
        });
    }

    let mut non_method = Budget::from_override(config.non_method_size, true);
    let mut profiled = Budget::from_override(config.profiled_size, config.tiered);
    let mut non_profiled = Budget::from_override(config.non_profiled_size, true);

    if !profiled.enabled {
        non_profiled.size += profiled.size;
        profiled.size = 0;
    }

    let non_method_min = config.minimum_use_space + config.compiler_buffer_size;
    if !non_method.set {
        non_method.size = align_up(non_method_min, granularity).max(granularity);
    }

    let mut cache_size = total;
    match (profiled.set, non_profiled.set) {
        (false, false) => {
            let rest = cache_size.saturating_sub(non_method.size);
            if profiled.enabled {
                profiled.size = rest / 2;
                non_profiled.size = rest - profiled.size;
            } else {
                non_profiled.size = rest;
            }
        }
        (false, true) => {
            if profiled.enabled {
                profiled.size = size_of_unset(
                    cache_size,
                    non_method.size + non_profiled.size,
                    granularity,
                );
            }
        }
        (true, false) => {
            non_profiled.size = size_of_unset(
                cache_size,
                non_method.size + profiled.size,
                granularity,
            );
        }
        (true, true) => {
            if !non_method.set {
                non_method.size = size_of_unset(
                    cache_size,
                    profiled.size + non_profiled.size,
                    non_method_min,
                );
            }
        }
    }

    let sum = non_method.size + profiled.size + non_profiled.size;
    if sum != cache_size {
        if pinned {
            let relation = if sum > cache_size {
                "is greater than"
            } else {
                "is less than"
            };
            return Err(CodeCacheError::InvalidHeapSizes {
                message: format!(
                    "non_method_size ({}K) + profiled_size ({}K) + non_profiled_size ({}K) \
                     = {}K {} reserved_size ({}K)",
                    non_method.size / 1024,
                    profiled.size / 1024,
                    non_profiled.size / 1024,
                    sum / 1024,
                    relation,
                    cache_size / 1024
                ),
                total: sum,
                reserved: cache_size,
            });
        }
        info!(
            "Code cache size adjusted from {}K to {}K to fit the heap sizes",
            cache_size / 1024,
            sum / 1024
        );
        cache_size = sum;
    }

    check_minimum(CodeHeapKind::NonMethod, non_method.size, non_method_min)?;
    if profiled.enabled {
        check_minimum(CodeHeapKind::MethodProfiled, profiled.size, granularity)?;
    }
    check_minimum(CodeHeapKind::MethodNonProfiled, non_profiled.size, granularity)?;

    // Round down; whatever is shaved off goes to the non-profiled heap.
    let non_method_size = align_down(non_method.size, granularity);
    let profiled_size = align_down(profiled.size, granularity);
    let remainder = (non_method.size - non_method_size) + (profiled.size - profiled_size);
    let reserved_size = if pinned {
        align_up(cache_size, granularity)
    } else {
        non_method_size + profiled_size + align_down(non_profiled.size + remainder, granularity)
    };
    let non_profiled_size = reserved_size - non_method_size - profiled_size;

    let mut heaps = vec![HeapSpec {
        kind: CodeHeapKind::NonMethod,
        size: non_method_size,
    }];
    if profiled.enabled {
        heaps.push(HeapSpec {
            kind: CodeHeapKind::MethodProfiled,
            size: profiled_size,
        });
    }
    heaps.push(HeapSpec {
        kind: CodeHeapKind::MethodNonProfiled,
        size: non_profiled_size,
    });

    debug!(
        "Code heap layout: non-method {}K, profiled {}K, non-profiled {}K (reserved {}K)",
        non_method_size / 1024,
        profiled_size / 1024,
        non_profiled_size / 1024,
        reserved_size / 1024
    );

    Ok(HeapLayout {
        reserved_size,
        granularity,
        segmented: true,
        heaps,
    })
}

fn check_minimum(kind: CodeHeapKind, size: usize, required: usize) -> Result<()> {
    if size < required {
        return Err(CodeCacheError::HeapBelowMinimum {
            heap: kind.heap_name(),
            size,
            required,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units::{K, M};

    fn pinned(total: usize) -> CodeCacheConfig {
        CodeCacheConfig::default().with_reserved_size(total)
    }

    #[test]
    fn even_split_after_non_method_minimum() {
        let layout = initialize_heaps(&pinned(64 * M)).unwrap();
        assert_eq!(layout.size_of(CodeHeapKind::NonMethod), Some(2 * M));
        assert_eq!(layout.size_of(CodeHeapKind::MethodProfiled), Some(31 * M));
        assert_eq!(layout.size_of(CodeHeapKind::MethodNonProfiled), Some(31 * M));
        assert_eq!(layout.total(), 64 * M);
        assert_eq!(layout.reserved_size, 64 * M);
    }

    #[test]
    fn profiled_budget_folds_into_non_profiled_without_tiers() {
        let config = CodeCacheConfig {
            tiered: false,
            ..pinned(64 * M)
        };
        let layout = initialize_heaps(&config).unwrap();
        assert_eq!(layout.heaps.len(), 2);
        assert_eq!(layout.size_of(CodeHeapKind::MethodProfiled), None);
        assert_eq!(layout.size_of(CodeHeapKind::MethodNonProfiled), Some(62 * M));
    }

    #[test]
    fn one_set_heap_leaves_the_rest_to_the_other() {
        let config = CodeCacheConfig {
            profiled_size: Some(10 * M),
            ..pinned(64 * M)
        };
        let layout = initialize_heaps(&config).unwrap();
        assert_eq!(layout.size_of(CodeHeapKind::MethodProfiled), Some(10 * M));
        assert_eq!(layout.size_of(CodeHeapKind::MethodNonProfiled), Some(52 * M));
    }

    #[test]
    fn non_method_takes_remainder_when_both_method_heaps_set() {
        let config = CodeCacheConfig {
            profiled_size: Some(20 * M),
            non_profiled_size: Some(40 * M),
            ..pinned(64 * M)
        };
        let layout = initialize_heaps(&config).unwrap();
        assert_eq!(layout.size_of(CodeHeapKind::NonMethod), Some(4 * M));
    }

    #[test]
    fn pinned_mismatch_is_rejected() {
        let config = CodeCacheConfig {
            non_method_size: Some(8 * M),
            profiled_size: Some(30 * M),
            non_profiled_size: Some(30 * M),
            ..pinned(64 * M)
        };
        match initialize_heaps(&config) {
            Err(CodeCacheError::InvalidHeapSizes {
                message,
                total,
                reserved,
            }) => {
                assert_eq!(total, 68 * M);
                assert_eq!(reserved, 64 * M);
                assert!(message.contains("is greater than"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn unpinned_total_follows_the_parts() {
        let config = CodeCacheConfig {
            non_method_size: Some(8 * M),
            profiled_size: Some(30 * M),
            non_profiled_size: Some(30 * M),
            ..Default::default()
        };
        let layout = initialize_heaps(&config).unwrap();
        assert_eq!(layout.reserved_size, 68 * M);
        assert_eq!(layout.total(), 68 * M);
    }

    #[test]
    fn too_small_non_method_heap_is_fatal() {
        let config = CodeCacheConfig {
            non_method_size: Some(512 * K),
            ..pinned(64 * M)
        };
        let err = initialize_heaps(&config).unwrap_err();
        assert!(matches!(
            err,
            CodeCacheError::HeapBelowMinimum {
                size,
                required,
                ..
            } if size == 512 * K && required == 2 * M
        ));
        assert!(err.is_fatal());
    }

    #[test]
    fn pinned_total_below_minimum_is_fatal() {
        let err = initialize_heaps(&pinned(M)).unwrap_err();
        assert!(matches!(err, CodeCacheError::HeapBelowMinimum { .. }));
    }

    #[test]
    fn unaligned_sizes_round_into_non_profiled() {
        let config = CodeCacheConfig {
            non_method_size: Some(2 * M + 1000),
            ..pinned(64 * M)
        };
        let layout = initialize_heaps(&config).unwrap();
        for heap in &layout.heaps {
            assert_eq!(heap.size % layout.granularity, 0);
        }
        assert_eq!(layout.size_of(CodeHeapKind::NonMethod), Some(2 * M));
        assert_eq!(layout.total(), 64 * M);
    }

    #[test]
    fn unsegmented_layout_is_a_single_heap() {
        let config = CodeCacheConfig {
            segmented: false,
            ..pinned(32 * M)
        };
        let layout = initialize_heaps(&config).unwrap();
        assert_eq!(
            layout.heaps,
            vec![HeapSpec {
                kind: CodeHeapKind::Unified,
                size: 32 * M
            }]
        );
    }

    #[test]
    fn placements_follow_address_order() {
        let layout = initialize_heaps(&pinned(64 * M)).unwrap();
        let placements = layout.placements();
        let kinds: Vec<_> = placements.iter().map(|p| p.kind).collect();
        assert_eq!(
            kinds,
            vec![
                CodeHeapKind::MethodProfiled,
                CodeHeapKind::NonMethod,
                CodeHeapKind::MethodNonProfiled
            ]
        );
        assert_eq!(placements[1].offset, 31 * M);
        assert_eq!(placements[2].offset, 33 * M);
    }
}
