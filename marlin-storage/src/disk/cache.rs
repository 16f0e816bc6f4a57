//! Process-wide cache of per-purpose free-space counts, used to pick a
//! volume for a new allocation without touching any volume header.
//!
//! The per-volume `hint_freepages` is advisory: deltas are applied under a
//! short critical section and may drift from the bitmap truth until the
//! next rebuild.

use hashbrown::HashMap;
use parking_lot::RwLock;

use super::header::VolPurpose;

#[derive(Debug, Clone, Copy, Default)]
pub struct PurposeInfo {
    pub nvols: i32,
    pub total_pages: i32,
    pub free_pages: i32,
    pub warnat_free_pages: i32,
}

#[derive(Debug, Clone, Copy)]
pub struct VolHint {
    pub purpose: VolPurpose,
    pub hint_freepages: i32,
    pub total_pages: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Contiguity {
    /// The request must fit one volume in one contiguous run.
    Contiguous,
    /// The request must fit one volume, runs may fragment.
    NonContiguous,
    /// The request may spill over several volumes.
    NonContiguousSpanVols,
}

#[derive(Debug, Default)]
struct CacheInner {
    per: HashMap<VolPurpose, PurposeInfo>,
    vols: HashMap<i16, VolHint>,
}

/// Readers take the shared lock while choosing a volume; a rebuild takes
/// the exclusive lock and therefore waits until no chooser remains.
#[derive(Debug, Default)]
pub struct PurposeCache {
    inner: RwLock<CacheInner>,
}

impl PurposeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn note_volume(&self, volid: i16, purpose: VolPurpose, total: i32, free: i32, warnat: i32) {
        let mut inner = self.inner.write();
        let info = inner.per.entry(purpose).or_default();
        info.nvols += 1;
        info.total_pages += total;
        info.free_pages += free;
        info.warnat_free_pages += warnat;
        inner.vols.insert(
            volid,
            VolHint {
                purpose,
                hint_freepages: free,
                total_pages: total,
            },
        );
    }

    pub fn forget_volume(&self, volid: i16) {
        let mut inner = self.inner.write();
        if let Some(hint) = inner.vols.remove(&volid) {
            if let Some(info) = inner.per.get_mut(&hint.purpose) {
                info.nvols -= 1;
                info.total_pages -= hint.total_pages;
                info.free_pages -= hint.hint_freepages;
            }
        }
    }

    /// Lightweight counter delta after an alloc (negative) or dealloc.
    pub fn apply_delta(&self, volid: i16, delta_free: i32) {
        let mut inner = self.inner.write();
        if let Some(hint) = inner.vols.get_mut(&volid) {
            hint.hint_freepages = (hint.hint_freepages + delta_free).max(0);
            let purpose = hint.purpose;
            if let Some(info) = inner.per.get_mut(&purpose) {
                info.free_pages = (info.free_pages + delta_free).max(0);
            }
        }
    }

    pub fn purpose_info(&self, purpose: VolPurpose) -> PurposeInfo {
        self.inner
            .read()
            .per
            .get(&purpose)
            .copied()
            .unwrap_or_default()
    }

    pub fn hint_freepages(&self, volid: i16) -> i32 {
        self.inner
            .read()
            .vols
            .get(&volid)
            .map(|h| h.hint_freepages)
            .unwrap_or(0)
    }

    /// Search cascade for a volume able to host `exp_npages` of the given
    /// purpose. DATA falls back to GENERIC, INDEX to GENERIC, temp
    /// requests to the permanent temp pool.
    pub fn find_good_vol(
        &self,
        purpose: VolPurpose,
        exp_npages: i32,
        undesirable_volid: Option<i16>,
        contiguity: Contiguity,
    ) -> Option<i16> {
        let cascade: &[VolPurpose] = match purpose {
            VolPurpose::PermData => &[VolPurpose::PermData, VolPurpose::PermGeneric],
            VolPurpose::PermIndex => &[VolPurpose::PermIndex, VolPurpose::PermGeneric],
            VolPurpose::PermGeneric => &[VolPurpose::PermGeneric],
            VolPurpose::TempTemp | VolPurpose::EitherTemp => {
                &[VolPurpose::TempTemp, VolPurpose::PermTemp]
            }
            VolPurpose::PermTemp => &[VolPurpose::PermTemp],
        };
        let needed = match contiguity {
            Contiguity::Contiguous | Contiguity::NonContiguous => exp_npages,
            // any volume with breathing room qualifies; the file layer
            // spans the remainder over further volumes
            Contiguity::NonContiguousSpanVols => 1,
        };

        let inner = self.inner.read();
        for &p in cascade {
            let mut best: Option<(i16, i32)> = None;
            for (&volid, hint) in inner.vols.iter() {
                if hint.purpose != p || Some(volid) == undesirable_volid {
                    continue;
                }
                if hint.hint_freepages >= needed {
                    match best {
                        Some((_, free)) if free >= hint.hint_freepages => {}
                        _ => best = Some((volid, hint.hint_freepages)),
                    }
                }
            }
            if let Some((volid, _)) = best {
                return Some(volid);
            }
        }
        None
    }

    /// Full rebuild from authoritative per-volume numbers.
    pub fn rebuild(&self, vols: impl Iterator<Item = (i16, VolPurpose, i32, i32, i32)>) {
        let mut inner = self.inner.write();
        inner.per.clear();
        inner.vols.clear();
        for (volid, purpose, total, free, warnat) in vols {
            let info = inner.per.entry(purpose).or_default();
            info.nvols += 1;
            info.total_pages += total;
            info.free_pages += free;
            info.warnat_free_pages += warnat;
            inner.vols.insert(
                volid,
                VolHint {
                    purpose,
                    hint_freepages: free,
                    total_pages: total,
                },
            );
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn data_falls_back_to_generic() {
        let cache = PurposeCache::new();
        cache.note_volume(0, VolPurpose::PermData, 100, 2, 10);
        cache.note_volume(1, VolPurpose::PermGeneric, 100, 90, 10);
        // data volume is nearly full: the cascade lands on generic
        assert_eq!(
            cache.find_good_vol(VolPurpose::PermData, 10, None, Contiguity::NonContiguous),
            Some(1)
        );
        // small request stays on the data volume
        assert_eq!(
            cache.find_good_vol(VolPurpose::PermData, 2, None, Contiguity::NonContiguous),
            Some(0)
        );
    }

    #[test]
    fn undesirable_volume_is_skipped() {
        let cache = PurposeCache::new();
        cache.note_volume(0, VolPurpose::PermIndex, 100, 50, 10);
        assert_eq!(
            cache.find_good_vol(VolPurpose::PermIndex, 10, Some(0), Contiguity::NonContiguous),
            None
        );
    }

    #[test]
    fn deltas_stay_advisory() {
        let cache = PurposeCache::new();
        cache.note_volume(0, VolPurpose::PermData, 100, 50, 10);
        cache.apply_delta(0, -10);
        cache.apply_delta(0, 4);
        let hint = cache.hint_freepages(0);
        // hint <= actual + small drift is all callers may assume
        assert!(hint <= 50);
        assert_eq!(hint, 44);
    }

    #[test]
    fn rebuild_resets_counters() {
        let cache = PurposeCache::new();
        cache.note_volume(0, VolPurpose::TempTemp, 100, 50, 10);
        cache.rebuild([(0i16, VolPurpose::TempTemp, 100, 73, 10)].into_iter());
        assert_eq!(cache.purpose_info(VolPurpose::TempTemp).free_pages, 73);
        assert_eq!(cache.hint_freepages(0), 73);
    }
}
