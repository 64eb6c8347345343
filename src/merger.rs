//! Merging of released candidates into non-overlapping output requests.
//!
//! For one negotiated interval the merger:
//!
//! 1. partitions the released requests into maximal clusters of transitively
//!    overlapping envelopes,
//! 2. folds every multi-member cluster into one merged request (provisional id),
//!    flattening members that are themselves merged,
//! 3. unions the readout elements of the merged request per
//!    `(type, source, dom)` key,
//! 4. drops or clips narrower elements already covered by a global element,
//! 5. orders the sub-requests by `(first, last)` ascending, then uid descending.
//!
//! Singleton clusters pass through untouched. Permanent ids are assigned later,
//! by the coordinator, just before emission.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::error::MergeError;
use crate::interval::Interval;
use crate::payload::SourceId;
use crate::request::{AlgorithmId, ReadoutElement, ReadoutKey, TriggerRequest, TriggerType};
use crate::throttle::LogThrottle;
use crate::uid::UidGenerator;

/// Config id stamped on merged requests.
pub const MERGED_CONFIG_ID: i32 = -1;

/// Combines the requests released for one interval.
#[derive(Debug)]
pub struct RequestMerger {
    source_id: SourceId,
    malformed: u64,
    malformed_log: LogThrottle,
}

impl RequestMerger {
    /// Creates a merger stamping `source_id` on the requests it builds.
    #[must_use]
    pub fn new(source_id: SourceId) -> Self {
        Self {
            source_id,
            malformed: 0,
            malformed_log: LogThrottle::default(),
        }
    }

    /// Requests dropped so far for lacking a usable envelope.
    #[must_use]
    pub const fn malformed_count(&self) -> u64 {
        self.malformed
    }

    /// Merges `requests` released for `interval`.
    ///
    /// The result is sorted by start time and pairwise non-overlapping.
    ///
    /// # Errors
    ///
    /// `MergeError::EmptyCluster` if clustering produced an empty cluster.
    pub fn merge(
        &mut self,
        interval: Interval,
        requests: Vec<TriggerRequest>,
        uids: &mut UidGenerator,
    ) -> Result<Vec<TriggerRequest>, MergeError> {
        let mut valid = Vec::with_capacity(requests.len());
        for req in requests {
            let Some(env) = req.envelope() else {
                self.malformed += 1;
                if self.malformed_log.should_log() {
                    warn!(interval = %interval, request = %req, "skipping request without a usable envelope");
                }
                continue;
            };
            if !interval.contains_interval(&env) {
                warn!(interval = %interval, request = %req, "released request extends outside its interval");
            }
            valid.push(req);
        }

        let clusters = cluster_by_overlap(valid);
        let mut out = Vec::with_capacity(clusters.len());
        for cluster in clusters {
            out.push(self.merge_cluster(interval, cluster, uids)?);
        }
        debug!(interval = %interval, outputs = out.len(), "merged interval");
        Ok(out)
    }

    /// Folds one cluster into a single request.
    ///
    /// # Errors
    ///
    /// `MergeError::EmptyCluster` for an empty cluster.
    pub fn merge_cluster(
        &self,
        interval: Interval,
        cluster: Vec<TriggerRequest>,
        uids: &mut UidGenerator,
    ) -> Result<TriggerRequest, MergeError> {
        let mut members = cluster.into_iter();
        let Some(first) = members.next() else {
            return Err(MergeError::EmptyCluster { interval });
        };

        let mut members = members.peekable();
        if members.peek().is_none() {
            return Ok(first);
        }

        let mut merged = self.provisional(&first, uids);
        absorb(&mut merged, first);
        for req in members {
            absorb(&mut merged, req);
        }
        finalize(&mut merged);
        Ok(merged)
    }

    fn provisional(&self, seed: &TriggerRequest, uids: &mut UidGenerator) -> TriggerRequest {
        let origin = AlgorithmId::new(TriggerType::MERGED, MERGED_CONFIG_ID, self.source_id);
        TriggerRequest::new(uids.next_provisional(), origin, seed.first_time, seed.last_time)
    }
}

/// Partitions requests into maximal clusters of transitively overlapping
/// envelopes, ordered by start time.
#[must_use]
pub fn cluster_by_overlap(mut requests: Vec<TriggerRequest>) -> Vec<Vec<TriggerRequest>> {
    requests.sort_by_key(|r| (r.first_time, r.last_time));

    let mut clusters: Vec<Vec<TriggerRequest>> = Vec::new();
    let mut cluster_end = i64::MIN;
    for req in requests {
        match clusters.last_mut() {
            Some(cluster) if req.first_time <= cluster_end => {
                cluster_end = cluster_end.max(req.last_time);
                cluster.push(req);
            }
            _ => {
                cluster_end = req.last_time;
                clusters.push(vec![req]);
            }
        }
    }
    clusters
}

/// Adds `req` to a merged request in progress.
///
/// A member that is already merged contributes its own sub-requests, so merged
/// requests never nest.
fn absorb(merged: &mut TriggerRequest, mut req: TriggerRequest) {
    merged.first_time = merged.first_time.min(req.first_time);
    merged.last_time = merged.last_time.max(req.last_time);

    if req.is_merged() {
        merged.elements.append(&mut req.elements);
        merged.sub_requests.append(&mut req.sub_requests);
    } else {
        merged.elements.extend(req.elements.iter().cloned());
        merged.sub_requests.push(req);
    }
}

fn finalize(merged: &mut TriggerRequest) {
    let elements = std::mem::take(&mut merged.elements);
    merged.elements = collapse_globals(reconcile_elements(elements));
    sort_sub_requests(&mut merged.sub_requests);
}

/// Unions the time ranges of elements sharing a `(type, source, dom)` key.
///
/// Output is ordered by key.
#[must_use]
pub fn reconcile_elements(elements: Vec<ReadoutElement>) -> Vec<ReadoutElement> {
    let mut by_key: BTreeMap<ReadoutKey, ReadoutElement> = BTreeMap::new();
    for el in elements {
        by_key
            .entry(el.key())
            .and_modify(|cur| {
                cur.first_time = cur.first_time.min(el.first_time);
                cur.last_time = cur.last_time.max(el.last_time);
            })
            .or_insert(el);
    }
    by_key.into_values().collect()
}

/// Removes the parts of narrower elements that a global element already reads out.
///
/// An element fully inside a covering global range is dropped; one that sticks
/// out is clipped to the tick before and/or after the global range.
#[must_use]
pub fn collapse_globals(elements: Vec<ReadoutElement>) -> Vec<ReadoutElement> {
    let globals: Vec<ReadoutElement> = elements.iter().filter(|e| e.readout_type.is_global()).cloned().collect();

    let mut result = elements;
    for global in &globals {
        let mut next = Vec::with_capacity(result.len());
        for el in result {
            if !el.is_covered_by(global) || el.last_time < global.first_time || el.first_time > global.last_time {
                next.push(el);
                continue;
            }
            if el.first_time < global.first_time {
                next.push(ReadoutElement {
                    last_time: global.first_time - 1,
                    ..el.clone()
                });
            }
            if el.last_time > global.last_time {
                next.push(ReadoutElement {
                    first_time: global.last_time + 1,
                    ..el
                });
            }
        }
        result = next;
    }
    result
}

/// Orders sub-requests by `(first_time, last_time)` ascending and, on equal
/// times, by uid descending.
pub fn sort_sub_requests(subs: &mut [TriggerRequest]) {
    subs.sort_by(|a, b| {
        a.first_time
            .cmp(&b.first_time)
            .then(a.last_time.cmp(&b.last_time))
            .then(b.uid.value().cmp(&a.uid.value()))
    });
}
