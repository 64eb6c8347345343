mod common;

use std::collections::BTreeSet;

use common::{leaves, Collect, Scripted, VecSource};
use trigctl::{
    AlgorithmId, EngineConfig, Interval, NullSink, QueueMode, ReadoutElement, ReadoutType, RequestMerger, RequestUid,
    SourceId, TriggerManager, TriggerRequest, TriggerType, UidGenerator,
};

/// Small deterministic generator so failures reproduce from the seed.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1_442_695_040_888_963_407);
        self.0 >> 33
    }

    fn range(&mut self, lo: i64, hi: i64) -> i64 {
        lo + (self.next() % (hi - lo + 1) as u64) as i64
    }
}

fn windows(rng: &mut Lcg) -> Vec<(i64, i64)> {
    let n = rng.range(3, 12);
    let mut t = rng.range(0, 50);
    let mut out = BTreeSet::new();
    for _ in 0..n {
        t += rng.range(0, 80);
        let len = rng.range(0, 60);
        out.insert((t, t + len));
    }
    out.into_iter().collect()
}

#[test]
fn pipeline_output_is_ordered_disjoint_and_complete() {
    for seed in 1..=12_u64 {
        let mut rng = Lcg(seed);
        let plans: Vec<Vec<(i64, i64)>> = (0..3).map(|_| windows(&mut rng)).collect();
        let end = plans.iter().flatten().map(|w| w.1).max().unwrap_or(0) + 50;
        let batch = rng.range(1, 8) as usize;

        let cfg = EngineConfig {
            first_uid: seed * 100,
            queue: QueueMode::Bounded { capacity: 8 },
            idle_poll_ms: 2,
            ..EngineConfig::default()
        };
        let mut mgr = TriggerManager::new(cfg).unwrap();
        let mut expected = Vec::new();
        for (i, plan) in plans.iter().enumerate() {
            let alg = Scripted::new(&format!("alg{i}"), i as i32, plan);
            let id = AlgorithmId::new(TriggerType(i as i32), 1, SourceId::INICE_TRIGGER);
            expected.extend(plan.iter().map(|(f, l)| (id, *f, *l)));
            mgr.register(Box::new(alg)).unwrap();
        }

        let sink = Collect::default();
        let hits = (0..=end).step_by(5);
        mgr.run(Box::new(VecSource::hits(hits, batch)), Box::new(sink.clone()), Box::new(NullSink))
            .unwrap();
        let out = sink.take();

        // Strictly increasing, non-overlapping emission.
        for pair in out.windows(2) {
            assert!(
                pair[0].last_time < pair[1].first_time,
                "seed {seed}: {} overlaps or precedes {}",
                pair[0],
                pair[1]
            );
        }

        // Every candidate exactly once.
        let mut seen: Vec<_> = out.iter().flat_map(leaves).collect();
        seen.sort();
        expected.sort();
        assert_eq!(seen, expected, "seed {seed}");

        // Consecutive final ids.
        for (i, req) in out.iter().enumerate() {
            assert_eq!(req.uid, RequestUid::Final(seed * 100 + i as u64), "seed {seed}");
        }

        for req in &out {
            if !req.is_merged() {
                continue;
            }
            assert!(req.sub_requests.len() >= 2, "seed {seed}");
            let first = req.sub_requests.iter().map(|r| r.first_time).min().unwrap();
            let last = req.sub_requests.iter().map(|r| r.last_time).max().unwrap();
            assert_eq!((req.first_time, req.last_time), (first, last), "seed {seed}");
            assert!(req
                .sub_requests
                .windows(2)
                .all(|w| (w[0].first_time, w[0].last_time) <= (w[1].first_time, w[1].last_time)));
        }
    }
}

fn random_request(rng: &mut Lcg, uid: u64) -> TriggerRequest {
    const TYPES: [ReadoutType; 6] = [
        ReadoutType::Global,
        ReadoutType::InIceGlobal,
        ReadoutType::IceTopGlobal,
        ReadoutType::InIceString,
        ReadoutType::InIceModule,
        ReadoutType::IceTopModule,
    ];
    let first = rng.range(0, 400);
    let last = first + rng.range(0, 100);
    let id = AlgorithmId::new(TriggerType(rng.range(0, 3) as i32), 1, SourceId::INICE_TRIGGER);
    let mut req = TriggerRequest::new(RequestUid::Provider(uid), id, first, last);
    for _ in 0..rng.range(1, 3) {
        let rt = TYPES[rng.range(0, 5) as usize];
        let mut el = ReadoutElement::new(rt, first - rng.range(0, 20), last + rng.range(0, 20));
        if !rt.is_global() {
            el = el.with_source(SourceId(12000 + rng.range(1, 3) as u32));
        }
        req.elements.push(el);
    }
    req
}

#[test]
fn merged_readouts_never_duplicate_global_coverage() {
    for seed in 1..=200_u64 {
        let mut rng = Lcg(seed);
        let requests: Vec<TriggerRequest> = (0..rng.range(1, 10) as u64).map(|uid| random_request(&mut rng, uid)).collect();
        let lo = requests.iter().map(|r| r.first_time).min().unwrap();
        let hi = requests.iter().map(|r| r.last_time).max().unwrap();

        let mut merger = RequestMerger::new(SourceId::GLOBAL_TRIGGER);
        let mut uids = UidGenerator::new(0);
        let out = merger
            .merge(Interval::new(lo, hi).unwrap(), requests.clone(), &mut uids)
            .unwrap();

        // Outputs are disjoint clusters that together hold every input.
        let total: usize = out.iter().map(|r| if r.is_merged() { r.sub_requests.len() } else { 1 }).sum();
        assert_eq!(total, requests.len(), "seed {seed}");
        for pair in out.windows(2) {
            assert!(pair[0].last_time < pair[1].first_time, "seed {seed}");
        }

        for req in out.iter().filter(|r| r.is_merged()) {
            let globals: Vec<&ReadoutElement> = req.elements.iter().filter(|e| e.readout_type.is_global()).collect();
            for el in &req.elements {
                for g in &globals {
                    if el.is_covered_by(g) {
                        let overlaps = el.first_time <= g.last_time && el.last_time >= g.first_time;
                        assert!(!overlaps, "seed {seed}: {el:?} still overlaps {g:?}");
                    }
                }
            }
        }
    }
}
