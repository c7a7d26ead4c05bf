//! Aggregates over the selected nodes.
//!
//! Each group keeps its running state in one byte buffer laid out by
//! [`agg_layout`]; the response carries the finished slots.

use std::collections::{BTreeMap, HashSet};

use bytes::Bytes;

use basedb_core::codec::{read_f64, read_i64, write_f64, write_i64, write_u32};
use basedb_core::hash::hash64;
use basedb_core::timestamp::step_bucket;
use basedb_core::{Result, TypeDef, Value};
use basedb_protocol::query::{agg_layout, AggKind, AggLayout, AggPlan, StepPlan};
use basedb_protocol::response::aggregate_result;

use super::{Executor, Hit};
use crate::store::Field;

struct Group {
    acc: Vec<u8>,
    distinct: Vec<HashSet<u64>>,
}

impl Group {
    fn new(layout: &AggLayout) -> Self {
        let mut acc = vec![0u8; layout.acc_size];
        for slot in &layout.slots {
            match slot.kind {
                AggKind::Min => write_f64(&mut acc, slot.acc_offset, f64::INFINITY),
                AggKind::Max => write_f64(&mut acc, slot.acc_offset, f64::NEG_INFINITY),
                _ => {}
            }
        }
        Self {
            acc,
            distinct: vec![HashSet::new(); layout.slots.len()],
        }
    }

    fn add(&mut self, slot: usize, kind: AggKind, off: usize, value: Option<&Value>) {
        let acc = self.acc.as_mut_slice();
        if kind == AggKind::Count {
            let n = read_i64(acc, off);
            write_i64(acc, off, n + 1);
            return;
        }
        if kind == AggKind::Cardinality {
            if let Some(value) = value {
                distinct_keys(value, &mut self.distinct[slot]);
            }
            return;
        }
        let Some(x) = value.and_then(Value::as_f64) else { return };
        match kind {
            AggKind::Sum => update_f64(acc, off, |v| v + x),
            AggKind::Min => update_f64(acc, off, |v| v.min(x)),
            AggKind::Max => update_f64(acc, off, |v| v.max(x)),
            AggKind::Avg => {
                update_f64(acc, off, |v| v + x);
                update_f64(acc, off + 8, |n| n + 1.0);
            }
            AggKind::Stddev => {
                // Welford: count, mean, sum of squared deviations.
                let n = read_f64(acc, off) + 1.0;
                let mean = read_f64(acc, off + 8);
                let delta = x - mean;
                let mean = mean + delta / n;
                let m2 = read_f64(acc, off + 16) + delta * (x - mean);
                write_f64(acc, off, n);
                write_f64(acc, off + 8, mean);
                write_f64(acc, off + 16, m2);
            }
            AggKind::Count | AggKind::Cardinality => {}
        }
    }

    fn finish(&self, layout: &AggLayout) -> Vec<u8> {
        let mut out = vec![0u8; layout.result_size];
        for (i, slot) in layout.slots.iter().enumerate() {
            let (acc, off, res) = (&self.acc, slot.acc_offset, slot.result_offset);
            match slot.kind {
                AggKind::Count => write_u32(&mut out, res, read_i64(acc, off) as u32),
                AggKind::Cardinality => write_f64(&mut out, res, self.distinct[i].len() as f64),
                AggKind::Sum => write_f64(&mut out, res, read_f64(acc, off)),
                AggKind::Min | AggKind::Max => {
                    let v = read_f64(acc, off);
                    write_f64(&mut out, res, if v.is_finite() { v } else { 0.0 });
                }
                AggKind::Avg => {
                    let n = read_f64(acc, off + 8);
                    write_f64(&mut out, res, if n > 0.0 { read_f64(acc, off) / n } else { 0.0 });
                }
                AggKind::Stddev => {
                    let n = read_f64(acc, off);
                    let sd = if n >= 2.0 { (read_f64(acc, off + 16) / (n - 1.0)).sqrt() } else { 0.0 };
                    write_f64(&mut out, res, sd);
                }
            }
        }
        out
    }
}

fn update_f64(acc: &mut [u8], off: usize, f: impl FnOnce(f64) -> f64) {
    let v = f(read_f64(acc, off));
    write_f64(acc, off, v);
}

fn distinct_keys(value: &Value, set: &mut HashSet<u64>) {
    match value {
        Value::Null => {}
        Value::List(items) => {
            for item in items {
                distinct_keys(item, set);
            }
        }
        other => {
            set.insert(hash64(other.key_string().as_bytes()));
        }
    }
}

/// Result of a plain `count()` answered from the node count.
pub(crate) fn count_only(count: usize) -> Bytes {
    aggregate_result(&[(String::new(), (count as u32).to_le_bytes().to_vec())])
}

impl Executor<'_> {
    pub(crate) fn aggregate(&self, def: &TypeDef, hits: &[Hit<'_>], agg: &AggPlan) -> Result<Bytes> {
        let layout = agg_layout(agg.fns.iter().map(|(kind, _)| *kind));
        let mut groups: BTreeMap<String, Group> = BTreeMap::new();

        for (id, node) in hits {
            let key = match &agg.group_by {
                None => String::new(),
                Some((field, step)) => {
                    let value = self.field_value(def, *id, node, field)?.unwrap_or(Value::Null);
                    group_key(&value, *step)
                }
            };
            let group = groups.entry(key).or_insert_with(|| Group::new(&layout));
            for (i, ((kind, field), slot)) in agg.fns.iter().zip(&layout.slots).enumerate() {
                if *kind == AggKind::Count {
                    group.add(i, *kind, slot.acc_offset, None);
                    continue;
                }
                // Cardinality fields carry their own distinct set.
                if let (AggKind::Cardinality, Some(Field::Cardinality(set))) = (kind, node.fields.get(&field.prop)) {
                    group.distinct[i].extend(set.iter().copied());
                    continue;
                }
                let value = self.field_value(def, *id, node, field)?;
                group.add(i, *kind, slot.acc_offset, value.as_ref());
            }
        }

        let groups: Vec<(String, Vec<u8>)> = groups.into_iter().map(|(k, g)| (k, g.finish(&layout))).collect();
        Ok(aggregate_result(&groups))
    }
}

fn group_key(value: &Value, step: StepPlan) -> String {
    let ms = value.as_i64().or_else(|| value.as_f64().map(|f| f as i64));
    match (step, ms) {
        (StepPlan::Fixed(step), Some(ms)) => step_bucket(ms, step).to_string(),
        (StepPlan::Calendar(interval), Some(ms)) => interval.bucket_key(ms),
        _ => match value {
            Value::List(items) => items.iter().map(Value::key_string).collect::<Vec<_>>().join(","),
            other => other.key_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use basedb_core::codec::read_u32;
    use basedb_core::timestamp::CalendarInterval;

    fn run(kinds: &[AggKind], values: &[f64]) -> (AggLayout, Vec<u8>) {
        let layout = agg_layout(kinds.iter().copied());
        let mut group = Group::new(&layout);
        for v in values {
            for (i, slot) in layout.slots.iter().enumerate() {
                let value = Value::Number(*v);
                group.add(i, slot.kind, slot.acc_offset, Some(&value));
            }
        }
        let out = group.finish(&layout);
        (layout, out)
    }

    #[test]
    fn test_numeric_aggregates() {
        let kinds = [AggKind::Count, AggKind::Sum, AggKind::Min, AggKind::Max, AggKind::Avg, AggKind::Stddev];
        let (layout, out) = run(&kinds, &[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
        let s = &layout.slots;
        assert_eq!(read_u32(&out, s[0].result_offset), 8);
        assert_eq!(read_f64(&out, s[1].result_offset), 40.0);
        assert_eq!(read_f64(&out, s[2].result_offset), 2.0);
        assert_eq!(read_f64(&out, s[3].result_offset), 9.0);
        assert_eq!(read_f64(&out, s[4].result_offset), 5.0);
        let sd = read_f64(&out, s[5].result_offset);
        assert!((sd - (32.0f64 / 7.0).sqrt()).abs() < 1e-9);
    }

    #[test]
    fn test_empty_group_is_zero() {
        let (layout, out) = run(&[AggKind::Min, AggKind::Avg, AggKind::Stddev], &[]);
        for slot in &layout.slots {
            assert_eq!(read_f64(&out, slot.result_offset), 0.0);
        }
    }

    #[test]
    fn test_cardinality_counts_distinct() {
        let (layout, out) = run(&[AggKind::Cardinality], &[1.0, 2.0, 1.0]);
        assert_eq!(read_f64(&out, layout.slots[0].result_offset), 2.0);
    }

    #[test]
    fn test_group_keys() {
        assert_eq!(group_key(&Value::Int(17), StepPlan::Fixed(5)), "15");
        assert_eq!(group_key(&Value::String("x".into()), StepPlan::None), "x");
        assert_eq!(
            group_key(&Value::Timestamp(0), StepPlan::Calendar(CalendarInterval::Month)),
            "1970-01"
        );
    }
}
