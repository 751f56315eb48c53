//! Worker selection.
//!
//! Selection is a pure function over a snapshot of worker loads:
//!
//! 1. Drop workers at capacity (`sessions >= max_sessions`).
//! 2. Drop workers that do not accept the target region.
//! 3. Rank by `(region_is_not_exact_match, sessions)` ascending.
//!
//! An `"all"` declaration accepts every region but never counts as an exact
//! match, so a regional worker wins over a catch-all one regardless of load.

use common::types::{Region, WorkerId};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Regions a worker is willing to serve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcceptableRegions {
    All,
    Only(Vec<Region>),
}

impl AcceptableRegions {
    /// `None` if the region is not served, otherwise whether it is an exact
    /// (explicitly listed) match.
    #[must_use]
    pub fn match_for(&self, region: &Region) -> Option<bool> {
        match self {
            AcceptableRegions::All => Some(false),
            AcceptableRegions::Only(regions) => regions.contains(region).then_some(true),
        }
    }
}

impl Serialize for AcceptableRegions {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            AcceptableRegions::All => serializer.serialize_str("all"),
            AcceptableRegions::Only(regions) => regions.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for AcceptableRegions {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Keyword(String),
            List(Vec<Region>),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Keyword(word) if word == "all" => Ok(AcceptableRegions::All),
            Raw::Keyword(other) => Err(serde::de::Error::custom(format!(
                "expected \"all\" or a list of regions, got \"{other}\""
            ))),
            Raw::List(regions) => Ok(AcceptableRegions::Only(regions)),
        }
    }
}

/// Capability info a worker declares at handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCapability {
    pub max_sessions: u32,
    pub acceptable_regions: AcceptableRegions,
}

/// Point-in-time load of one worker, as seen by selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerLoad {
    pub id: WorkerId,
    pub sessions: u32,
    pub max_sessions: u32,
    pub acceptable_regions: AcceptableRegions,
}

impl WorkerLoad {
    fn rank_for(&self, region: &Region) -> Option<(bool, u32)> {
        if self.sessions >= self.max_sessions {
            return None;
        }
        let exact = self.acceptable_regions.match_for(region)?;
        Some((!exact, self.sessions))
    }
}

/// Pick the best worker for `region`, or `None` if nobody is eligible.
///
/// Ties keep the first candidate in iteration order.
pub fn select<'a, I>(candidates: I, region: &Region) -> Option<&'a WorkerLoad>
where
    I: IntoIterator<Item = &'a WorkerLoad>,
{
    candidates
        .into_iter()
        .filter_map(|worker| worker.rank_for(region).map(|rank| (rank, worker)))
        .min_by_key(|(rank, _)| *rank)
        .map(|(_, worker)| worker)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn worker(id: &str, sessions: u32, max: u32, regions: AcceptableRegions) -> WorkerLoad {
        WorkerLoad {
            id: WorkerId::from(id),
            sessions,
            max_sessions: max,
            acceptable_regions: regions,
        }
    }

    fn only(regions: &[&str]) -> AcceptableRegions {
        AcceptableRegions::Only(regions.iter().map(|r| Region::from(*r)).collect())
    }

    #[test]
    fn test_exact_region_beats_catch_all_with_lower_load() {
        let workers = [
            worker("A", 2, 5, only(&["us-east"])),
            worker("B", 1, 5, AcceptableRegions::All),
        ];

        let picked = select(&workers, &Region::from("us-east")).unwrap();
        assert_eq!(picked.id.as_str(), "A");
    }

    #[test]
    fn test_catch_all_serves_unlisted_region() {
        let workers = [
            worker("A", 2, 5, only(&["us-east"])),
            worker("B", 1, 5, AcceptableRegions::All),
        ];

        let picked = select(&workers, &Region::from("eu-west")).unwrap();
        assert_eq!(picked.id.as_str(), "B");
    }

    #[test]
    fn test_workers_at_capacity_are_ineligible() {
        let workers = [
            worker("A", 5, 5, only(&["us-east"])),
            worker("B", 5, 5, AcceptableRegions::All),
        ];

        assert!(select(&workers, &Region::from("us-east")).is_none());
    }

    #[test]
    fn test_lower_load_wins_among_exact_matches() {
        let workers = [
            worker("A", 3, 15, only(&["us-west", "us-east"])),
            worker("B", 1, 15, only(&["us-east"])),
            worker("C", 0, 15, only(&["eu-west"])),
        ];

        let picked = select(&workers, &Region::from("us-east")).unwrap();
        assert_eq!(picked.id.as_str(), "B");
    }

    #[test]
    fn test_no_candidates() {
        let workers: [WorkerLoad; 0] = [];
        assert!(select(&workers, &Region::from("us-east")).is_none());
    }

    #[test]
    fn test_zero_capacity_worker_never_selected() {
        let workers = [worker("A", 0, 0, AcceptableRegions::All)];
        assert!(select(&workers, &Region::from("us-east")).is_none());
    }

    #[test]
    fn test_capability_deserializes_both_region_forms() {
        let all: WorkerCapability =
            serde_json::from_value(json!({"max_sessions": 15, "acceptable_regions": "all"}))
                .unwrap();
        assert_eq!(all.acceptable_regions, AcceptableRegions::All);

        let listed: WorkerCapability = serde_json::from_value(
            json!({"max_sessions": 15, "acceptable_regions": ["us-west", "us-east"]}),
        )
        .unwrap();
        assert_eq!(listed.acceptable_regions, only(&["us-west", "us-east"]));
    }

    #[test]
    fn test_capability_rejects_unknown_keyword() {
        let result: Result<WorkerCapability, _> =
            serde_json::from_value(json!({"max_sessions": 1, "acceptable_regions": "some"}));
        assert!(result.is_err());
    }

    #[test]
    fn test_all_is_never_exact() {
        assert_eq!(
            AcceptableRegions::All.match_for(&Region::from("all")),
            Some(false)
        );
        assert_eq!(only(&["us-east"]).match_for(&Region::from("eu")), None);
    }
}
