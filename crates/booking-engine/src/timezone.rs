//! Cached building → timezone resolution.

use chrono_tz::Tz;
use dashmap::DashMap;
use tracing::warn;

use crate::model::Reservable;
use crate::ports::BuildingTimeZoneLookup;

/// Resolves the timezone of a reservable, asking the lookup at most once per
/// building. Safe to share between threads.
pub struct TimeZoneCache {
    lookup: Box<dyn BuildingTimeZoneLookup>,
    cache: DashMap<String, Option<Tz>>,
    default: Tz,
}

impl TimeZoneCache {
    pub fn new(lookup: Box<dyn BuildingTimeZoneLookup>, default: Tz) -> Self {
        Self {
            lookup,
            cache: DashMap::new(),
            default,
        }
    }

    pub fn default_timezone(&self) -> Tz {
        self.default
    }

    /// Timezone of a building, or `None` if unknown or unparseable.
    pub fn building(&self, building_id: &str) -> Option<Tz> {
        if let Some(hit) = self.cache.get(building_id) {
            return *hit;
        }
        // The entry guard holds the shard lock, so concurrent misses on the
        // same key populate it once.
        *self
            .cache
            .entry(building_id.to_string())
            .or_insert_with(|| self.resolve(building_id))
    }

    /// Rooms use their building's timezone; resources and unknown buildings
    /// fall back to the configured default.
    pub fn for_reservable(&self, reservable: &Reservable) -> Tz {
        match reservable {
            Reservable::Room { building_id, .. } => {
                self.building(building_id).unwrap_or(self.default)
            }
            Reservable::Resource { .. } => self.default,
        }
    }

    fn resolve(&self, building_id: &str) -> Option<Tz> {
        let id = self.lookup.timezone_id(building_id)?;
        match id.parse::<Tz>() {
            Ok(tz) => Some(tz),
            Err(_) => {
                warn!(building_id, timezone = %id, "building has an invalid timezone");
                None
            }
        }
    }
}

impl std::fmt::Debug for TimeZoneCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeZoneCache")
            .field("cached", &self.cache.len())
            .field("default", &self.default)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingLookup {
        calls: Arc<AtomicUsize>,
    }

    impl BuildingTimeZoneLookup for CountingLookup {
        fn timezone_id(&self, building_id: &str) -> Option<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match building_id {
                "berlin" => Some("Europe/Berlin".to_string()),
                "broken" => Some("Mars/Olympus_Mons".to_string()),
                _ => None,
            }
        }
    }

    fn cache() -> (TimeZoneCache, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let lookup = CountingLookup {
            calls: Arc::clone(&calls),
        };
        (TimeZoneCache::new(Box::new(lookup), Tz::UTC), calls)
    }

    #[test]
    fn lookup_runs_once_per_building() {
        let (cache, calls) = cache();
        for _ in 0..3 {
            assert_eq!(cache.building("berlin"), Some(chrono_tz::Europe::Berlin));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn misses_are_cached_too() {
        let (cache, calls) = cache();
        assert_eq!(cache.building("nowhere"), None);
        assert_eq!(cache.building("nowhere"), None);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn invalid_zone_falls_back_to_default() {
        let (cache, _) = cache();
        let room = Reservable::room("r1", "broken");
        assert_eq!(cache.for_reservable(&room), Tz::UTC);
    }

    #[test]
    fn resources_use_default() {
        let (cache, calls) = cache();
        assert_eq!(cache.for_reservable(&Reservable::resource("projector")), Tz::UTC);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn concurrent_readers_share_one_population() {
        let (cache, calls) = cache();
        let cache = Arc::new(cache);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || cache.building("berlin"))
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), Some(chrono_tz::Europe::Berlin));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
