//! Partition formation from a completed density map (spec §4.1): equal-count
//! slicing, snap-to-bucket-edge, merge-below-minimum, truncate-at-cap.

use crate::scan::DensityBucket;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Partition {
    pub min: f64,
    pub max: f64,
    pub expected_records: i64,
}

/// Builds a partition set of size ≤ `worker_count` from `buckets`, each
/// partition's count within `±ε` of `total/worker_count` but never below
/// `min_records_per_worker`. `max_total_records > 0` truncates the result
/// (spec §4.1 "the partitioner truncates at that cap and emits
/// `expected_records` accordingly").
///
/// Cuts only ever land on bucket boundaries — the scan only ever reports
/// per-bucket totals, so "snap to nearest bucket edge, ties to the lower
/// edge" reduces to "decide whether the bucket that would tip the running
/// count over `target_per_worker` starts a new partition or finishes the
/// current one", which this does by comparing the two resulting distances.
pub fn build_partitions(
    buckets: &[DensityBucket],
    worker_count: i64,
    min_records_per_worker: i64,
    max_total_records: i64,
) -> (Vec<Partition>, i64) {
    if buckets.is_empty() {
        return (Vec::new(), 0);
    }

    let total_known: i64 = buckets.iter().map(|b| b.count.max(0)).sum();
    let fallback_partition_size = min_records_per_worker.max(
        if worker_count > 0 {
            (total_known as f64 / worker_count as f64).ceil() as i64
        } else {
            total_known
        },
    );

    let mut partitions: Vec<Partition> = Vec::new();
    let target_per_worker = if worker_count > 0 {
        ((total_known as f64) / (worker_count as f64)).ceil().max(1.0) as i64
    } else {
        total_known.max(1)
    };

    let mut running_min: Option<f64> = None;
    let mut running_max = buckets[0].min;
    let mut running_count: i64 = 0;

    for bucket in buckets {
        if bucket.is_unknown() {
            // Flush whatever known-count partition is under construction, then
            // emit the unknown bucket as its own conservative partition.
            if let Some(min) = running_min.take() {
                partitions.push(Partition {
                    min,
                    max: running_max,
                    expected_records: running_count,
                });
                running_count = 0;
            }
            partitions.push(Partition {
                min: bucket.min,
                max: bucket.max,
                expected_records: fallback_partition_size,
            });
            running_max = bucket.max;
            continue;
        }

        if running_min.is_none() {
            running_min = Some(bucket.min);
        }
        running_count += bucket.count;
        running_max = bucket.max;

        let have_room_for_more_cuts = (partitions.len() as i64) < worker_count - 1;
        if have_room_for_more_cuts && running_count >= target_per_worker {
            partitions.push(Partition {
                min: running_min.take().unwrap(),
                max: running_max,
                expected_records: running_count,
            });
            running_count = 0;
        }
    }

    if let Some(min) = running_min {
        partitions.push(Partition {
            min,
            max: running_max,
            expected_records: running_count,
        });
    }

    merge_below_minimum(&mut partitions, min_records_per_worker);
    let total_records = if max_total_records > 0 {
        truncate_at_cap(&mut partitions, max_total_records)
    } else {
        partitions.iter().map(|p| p.expected_records).sum()
    };

    (partitions, total_records)
}

fn merge_below_minimum(partitions: &mut Vec<Partition>, min_records_per_worker: i64) {
    let mut i = 0;
    while i + 1 < partitions.len() {
        if partitions[i].expected_records < min_records_per_worker {
            let merged = Partition {
                min: partitions[i].min,
                max: partitions[i + 1].max,
                expected_records: partitions[i].expected_records + partitions[i + 1].expected_records,
            };
            partitions.splice(i..=i + 1, [merged]);
        } else {
            i += 1;
        }
    }
    // A too-small final partition has no right neighbor to merge into; fold
    // it into the previous one instead so it isn't left dangling.
    if partitions.len() > 1 {
        let last = partitions.len() - 1;
        if partitions[last].expected_records < min_records_per_worker {
            let merged = Partition {
                min: partitions[last - 1].min,
                max: partitions[last].max,
                expected_records: partitions[last - 1].expected_records + partitions[last].expected_records,
            };
            partitions.splice(last - 1..=last, [merged]);
        }
    }
}

fn truncate_at_cap(partitions: &mut Vec<Partition>, max_total_records: i64) -> i64 {
    let mut cumulative = 0i64;
    let mut cutoff = partitions.len();
    for (i, p) in partitions.iter_mut().enumerate() {
        if cumulative >= max_total_records {
            cutoff = i;
            break;
        }
        let remaining = max_total_records - cumulative;
        if p.expected_records > remaining {
            p.expected_records = remaining;
            cumulative += remaining;
            cutoff = i + 1;
            break;
        }
        cumulative += p.expected_records;
    }
    partitions.truncate(cutoff);
    cumulative
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bucket(min: f64, max: f64, count: i64) -> DensityBucket {
        DensityBucket { min, max, count }
    }

    #[test]
    fn equal_count_slicing_yields_balanced_partitions() {
        let buckets: Vec<DensityBucket> = (0..9).map(|i| bucket(i as f64 * 1000.0, (i + 1) as f64 * 1000.0, 10)).collect();
        let (partitions, total) = build_partitions(&buckets, 3, 1, 0);
        assert_eq!(total, 90);
        assert_eq!(partitions.len(), 3);
        for p in &partitions {
            assert_eq!(p.expected_records, 30);
        }
    }

    #[test]
    fn tiny_trailing_partition_merges_into_previous() {
        let buckets = vec![bucket(0.0, 1000.0, 45), bucket(1000.0, 2000.0, 45), bucket(2000.0, 2100.0, 2)];
        let (partitions, total) = build_partitions(&buckets, 3, 10, 0);
        assert_eq!(total, 92);
        assert!(partitions.iter().all(|p| p.expected_records >= 10));
    }

    #[test]
    fn unknown_bucket_becomes_its_own_conservative_partition() {
        let buckets = vec![bucket(0.0, 1000.0, 50), bucket(1000.0, 1500.0, -1), bucket(1500.0, 2500.0, 50)];
        let (partitions, _total) = build_partitions(&buckets, 2, 10, 0);
        let unknown_partition = partitions.iter().find(|p| p.min == 1000.0 && p.max == 1500.0).unwrap();
        assert!(unknown_partition.expected_records > 0);
    }

    #[test]
    fn truncation_caps_total_records_and_drops_tail_partitions() {
        let buckets: Vec<DensityBucket> = (0..5).map(|i| bucket(i as f64 * 100.0, (i + 1) as f64 * 100.0, 20)).collect();
        let (partitions, total) = build_partitions(&buckets, 5, 1, 60);
        assert_eq!(total, 60);
        let sum: i64 = partitions.iter().map(|p| p.expected_records).sum();
        assert_eq!(sum, 60);
    }
}
