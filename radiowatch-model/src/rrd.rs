// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Ring-over-time aggregation.
//!
//! An RRD keeps 60 seconds of the last minute, 60 minutes of the last hour,
//! and 24 hours of the last day, cascading samples upward as time advances.
//! The math is parameterized over an [`Aggregator`] per tier so packet
//! counters (sum/mean), signal levels (peak, ignore empty), and queue depths
//! (extreme) share one implementation.
//!
//! Not thread safe on its own; wrap in a `Mutex` when shared.

use std::fmt;
use std::marker::PhantomData;

use crate::element::{scalar, Element, ElementError, ElementRef, KeyedMap, TrackedElement};
use crate::fields::{ElementBuilder, EntryTracker};
use crate::ElementType;

pub trait Aggregator: Send + Sync + 'static {
    /// Merge a new sample into an existing bucket.
    fn combine(a: f64, b: f64) -> f64;
    /// Collapse a full ring into one bucket of the next tier.
    fn combine_vector(v: &[f64]) -> f64;
    /// The value an empty bucket holds.
    fn default_val() -> f64 {
        0.0
    }
    fn name() -> &'static str;
}

/// Sum on combine, plain mean on cascade.
pub struct DefaultAggregator;

impl Aggregator for DefaultAggregator {
    fn combine(a: f64, b: f64) -> f64 {
        a + b
    }

    fn combine_vector(v: &[f64]) -> f64 {
        if v.is_empty() {
            return 0.0;
        }
        v.iter().sum::<f64>() / v.len() as f64
    }

    fn name() -> &'static str {
        "default"
    }
}

/// Stronger signal wins; cascade averages only the non-empty slots since a
/// real signal level is never exactly zero.
pub struct PeakSignalAggregator;

impl Aggregator for PeakSignalAggregator {
    fn combine(a: f64, b: f64) -> f64 {
        if a == 0.0 {
            return b;
        }
        if b == 0.0 {
            return a;
        }
        a.max(b)
    }

    fn combine_vector(v: &[f64]) -> f64 {
        let mut sum = 0.0;
        let mut n = 0u32;
        for &x in v {
            if x != 0.0 {
                sum += x;
                n += 1;
            }
        }
        if n == 0 {
            Self::default_val()
        } else {
            sum / n as f64
        }
    }

    fn name() -> &'static str {
        "peak_signal"
    }
}

/// Magnitude-preferring: matching signs keep the extreme, mixed signs keep
/// the lowest.
pub struct ExtremeAggregator;

impl ExtremeAggregator {
    fn extreme(a: f64, b: f64) -> f64 {
        if a < 0.0 && b < 0.0 {
            a.min(b)
        } else if a > 0.0 && b > 0.0 {
            a.max(b)
        } else if a == 0.0 {
            b
        } else if b == 0.0 {
            a
        } else {
            a.min(b)
        }
    }
}

impl Aggregator for ExtremeAggregator {
    fn combine(a: f64, b: f64) -> f64 {
        Self::extreme(a, b)
    }

    fn combine_vector(v: &[f64]) -> f64 {
        v.iter().fold(0.0, |acc, &x| Self::extreme(acc, x))
    }

    fn name() -> &'static str {
        "extreme"
    }
}

/// Largest positive value of the previous range.
pub struct PrevPosExtremeAggregator;

impl Aggregator for PrevPosExtremeAggregator {
    fn combine(a: f64, b: f64) -> f64 {
        ExtremeAggregator::extreme(a, b)
    }

    fn combine_vector(v: &[f64]) -> f64 {
        v.iter().fold(0.0, |acc, &x| if x > acc { x } else { acc })
    }

    fn name() -> &'static str {
        "prev_pos_extreme"
    }
}

const DAY_SECS: u64 = 86400;
const HOUR_SECS: u64 = 3600;

fn ring_gap(from: usize, to: usize, len: usize) -> usize {
    let from = from % len;
    let to = to % len;
    if from == to {
        0
    } else if from < to {
        to - from
    } else {
        len - from + to
    }
}

/// Three-tier RRD.  `M` aggregates seconds, `H` cascades seconds into
/// minutes, `D` cascades minutes into hours.
pub struct Rrd<M: Aggregator = DefaultAggregator, H: Aggregator = DefaultAggregator, D: Aggregator = DefaultAggregator>
{
    last_time: u64,
    serial_time: u64,
    last_value: f64,
    last_value_n1: f64,
    minute_vec: [f64; 60],
    hour_vec: [f64; 60],
    day_vec: [f64; 24],
    update_first: bool,
    _agg: PhantomData<(M, H, D)>,
}

impl<M: Aggregator, H: Aggregator, D: Aggregator> Default for Rrd<M, H, D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Aggregator, H: Aggregator, D: Aggregator> Rrd<M, H, D> {
    pub fn new() -> Self {
        Rrd {
            last_time: 0,
            serial_time: 0,
            last_value: 0.0,
            last_value_n1: 0.0,
            minute_vec: [M::default_val(); 60],
            hour_vec: [H::default_val(); 60],
            day_vec: [D::default_val(); 24],
            update_first: true,
            _agg: PhantomData,
        }
    }

    /// Records updated on a timer and read back raw may not want the
    /// serialize-time fast-forward.
    pub fn update_before_serialize(&mut self, update: bool) {
        self.update_first = update;
    }

    pub fn last_time(&self) -> u64 {
        self.last_time
    }

    pub fn last_value(&self) -> f64 {
        self.last_value
    }

    pub fn last_value_n1(&self) -> f64 {
        self.last_value_n1
    }

    pub fn minute_vec(&self) -> &[f64; 60] {
        &self.minute_vec
    }

    pub fn hour_vec(&self) -> &[f64; 60] {
        &self.hour_vec
    }

    pub fn day_vec(&self) -> &[f64; 24] {
        &self.day_vec
    }

    pub fn add_sample(&mut self, in_s: f64, in_time: u64) {
        let sec_bucket = (in_time % 60) as usize;
        let min_bucket = ((in_time / 60) % 60) as usize;
        let hour_bucket = ((in_time / 3600) % 24) as usize;

        let ltime = self.last_time;
        let last_sec_bucket = (ltime % 60) as usize;
        let last_min_bucket = ((ltime / 60) % 60) as usize;
        let last_hour_bucket = ((ltime / 3600) % 24) as usize;

        if in_time == ltime {
            self.last_value_n1 = self.last_value;
            self.last_value = M::combine(self.last_value, in_s);
        } else {
            self.last_value_n1 = self.last_value;
            self.last_value = in_s;
        }

        if in_time < ltime {
            // Backfill within the past minute: packets may arrive slightly
            // out of order.  Anything older is discarded.
            if ltime - in_time > 60 {
                return;
            }
            self.minute_vec[sec_bucket] = M::combine(self.minute_vec[sec_bucket], in_s);
            return;
        }

        if in_time - ltime >= DAY_SECS {
            // A full day without data means every ring is stale.  Reset to
            // this single sample and cascade it up.
            for (i, slot) in self.minute_vec.iter_mut().enumerate() {
                *slot = if i == sec_bucket { in_s } else { M::default_val() };
            }

            let min_val = H::combine_vector(&self.minute_vec);
            for (i, slot) in self.hour_vec.iter_mut().enumerate() {
                *slot = if i == min_bucket { min_val } else { H::default_val() };
            }

            let hr_val = D::combine_vector(&self.hour_vec);
            for (i, slot) in self.day_vec.iter_mut().enumerate() {
                *slot = if i == hour_bucket { hr_val } else { D::default_val() };
            }

            self.last_time = in_time;
            return;
        }

        if in_time - ltime > HOUR_SECS {
            // Over an hour but within the day: the minute and hour rings
            // hold only this sample's lineage, the day ring fast-forwards
            // through the silent hours.
            for (i, slot) in self.minute_vec.iter_mut().enumerate() {
                *slot = if i == sec_bucket { in_s } else { M::default_val() };
            }
            let sec_avg = H::combine_vector(&self.minute_vec);

            for (i, slot) in self.hour_vec.iter_mut().enumerate() {
                *slot = if i == min_bucket { sec_avg } else { H::default_val() };
            }
            let min_avg = D::combine_vector(&self.hour_vec);

            for h in 0..ring_gap(last_hour_bucket + 1, hour_bucket, 24) {
                self.day_vec[(last_hour_bucket + 1 + h) % 24] = D::default_val();
            }
            self.day_vec[hour_bucket] = min_avg;

            self.last_time = in_time;
            return;
        }

        if in_time - ltime > 60 {
            // Over a minute: reset seconds to this sample, zero the silent
            // minutes, update the minute and hour aggregates.
            for (i, slot) in self.minute_vec.iter_mut().enumerate() {
                *slot = if i == sec_bucket { in_s } else { M::default_val() };
            }
            let sec_avg = H::combine_vector(&self.minute_vec);

            for m in 0..ring_gap(last_min_bucket + 1, min_bucket, 60) {
                self.hour_vec[(last_min_bucket + 1 + m) % 60] = H::default_val();
            }
            self.hour_vec[min_bucket] = sec_avg;

            let min_avg = D::combine_vector(&self.hour_vec);
            self.day_vec[hour_bucket] = min_avg;

            self.last_time = in_time;
            return;
        }

        // Within the minute: combine on the exact same second, otherwise
        // fast-forward the silent seconds and take the new sample.
        if in_time == ltime {
            self.minute_vec[sec_bucket] = M::combine(self.minute_vec[sec_bucket], in_s);
        } else {
            for s in 0..ring_gap(last_sec_bucket + 1, sec_bucket, 60) {
                self.minute_vec[(last_sec_bucket + 1 + s) % 60] = M::default_val();
            }
            self.minute_vec[sec_bucket] = in_s;
        }

        let sec_avg = H::combine_vector(&self.minute_vec);
        self.hour_vec[min_bucket] = sec_avg;

        let min_avg = D::combine_vector(&self.hour_vec);
        self.day_vec[hour_bucket] = min_avg;

        self.last_time = in_time;
    }

    /// Serialize-time sync: fast-forward to `now` so long-idle records show
    /// their decay, and stamp the serialization time.
    pub fn pre_serialize(&mut self, now: u64) {
        self.serial_time = now;
        if self.update_first {
            self.add_sample(M::default_val(), now);
        }
    }

    /// Snapshot into an element map for the serializers.
    pub fn to_element(&self, registry: &EntryTracker) -> Result<ElementRef, ElementError> {
        let f_map = registry.register_field(
            "radiowatch.common.rrd",
            ElementBuilder::Type(ElementType::Map),
            "rrd record",
        )?;
        let f_last_time = registry.register_field(
            "radiowatch.common.rrd.last_time",
            ElementBuilder::Type(ElementType::U64),
            "last time updated",
        )?;
        let f_serial_time = registry.register_field(
            "radiowatch.common.rrd.serial_time",
            ElementBuilder::Type(ElementType::U64),
            "timestamp of serialization",
        )?;
        let f_last_value = registry.register_field(
            "radiowatch.common.rrd.last_value",
            ElementBuilder::Type(ElementType::F64),
            "most recent value",
        )?;
        let f_last_value_n1 = registry.register_field(
            "radiowatch.common.rrd.last_value_n1",
            ElementBuilder::Type(ElementType::F64),
            "previous most recent value",
        )?;
        let f_minute = registry.register_field(
            "radiowatch.common.rrd.minute_vec",
            ElementBuilder::Type(ElementType::VectorDouble),
            "past minute values per second",
        )?;
        let f_hour = registry.register_field(
            "radiowatch.common.rrd.hour_vec",
            ElementBuilder::Type(ElementType::VectorDouble),
            "past hour values per minute",
        )?;
        let f_day = registry.register_field(
            "radiowatch.common.rrd.day_vec",
            ElementBuilder::Type(ElementType::VectorDouble),
            "past day values per hour",
        )?;
        let f_blank = registry.register_field(
            "radiowatch.common.rrd.blank_val",
            ElementBuilder::Type(ElementType::F64),
            "empty bucket value",
        )?;

        let mut m = KeyedMap::new();
        m.entries
            .insert(f_last_time, scalar(f_last_time, Element::U64(self.last_time)));
        m.entries.insert(
            f_serial_time,
            scalar(f_serial_time, Element::U64(self.serial_time)),
        );
        m.entries.insert(
            f_last_value,
            scalar(f_last_value, Element::F64(self.last_value)),
        );
        m.entries.insert(
            f_last_value_n1,
            scalar(f_last_value_n1, Element::F64(self.last_value_n1)),
        );
        m.entries.insert(
            f_minute,
            scalar(f_minute, Element::VectorDouble(self.minute_vec.to_vec())),
        );
        m.entries.insert(
            f_hour,
            scalar(f_hour, Element::VectorDouble(self.hour_vec.to_vec())),
        );
        m.entries.insert(
            f_day,
            scalar(f_day, Element::VectorDouble(self.day_vec.to_vec())),
        );
        m.entries
            .insert(f_blank, scalar(f_blank, Element::F64(M::default_val())));

        Ok(TrackedElement::new(f_map, Element::Map(m)).into_ref())
    }
}

/// Single-ring variant for records that only ever need the last minute.
pub struct MinuteRrd<A: Aggregator = DefaultAggregator> {
    last_time: u64,
    last_value: f64,
    last_value_n1: f64,
    minute_vec: [f64; 60],
    _agg: PhantomData<A>,
}

impl<A: Aggregator> fmt::Debug for MinuteRrd<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MinuteRrd")
            .field("last_time", &self.last_time)
            .field("last_value", &self.last_value)
            .field("last_value_n1", &self.last_value_n1)
            .field("minute_vec", &self.minute_vec)
            .finish()
    }
}

impl<A: Aggregator> Default for MinuteRrd<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Aggregator> MinuteRrd<A> {
    pub fn new() -> Self {
        MinuteRrd {
            last_time: 0,
            last_value: 0.0,
            last_value_n1: 0.0,
            minute_vec: [A::default_val(); 60],
            _agg: PhantomData,
        }
    }

    pub fn last_time(&self) -> u64 {
        self.last_time
    }

    pub fn last_value(&self) -> f64 {
        self.last_value
    }

    pub fn minute_vec(&self) -> &[f64; 60] {
        &self.minute_vec
    }

    pub fn add_sample(&mut self, in_s: f64, in_time: u64) {
        let sec_bucket = (in_time % 60) as usize;
        let ltime = self.last_time;
        let last_sec_bucket = (ltime % 60) as usize;

        if in_time == ltime {
            self.last_value_n1 = self.last_value;
            self.last_value = A::combine(self.last_value, in_s);
        } else {
            self.last_value_n1 = self.last_value;
            self.last_value = in_s;
        }

        if in_time < ltime {
            if ltime - in_time > 60 {
                return;
            }
            self.minute_vec[sec_bucket] = A::combine(self.minute_vec[sec_bucket], in_s);
            return;
        }

        if in_time - ltime > 60 {
            for slot in self.minute_vec.iter_mut() {
                *slot = A::default_val();
            }
            self.minute_vec[sec_bucket] = in_s;
        } else if in_time == ltime {
            self.minute_vec[sec_bucket] = A::combine(self.minute_vec[sec_bucket], in_s);
        } else {
            for s in 0..ring_gap(last_sec_bucket + 1, sec_bucket, 60) {
                self.minute_vec[(last_sec_bucket + 1 + s) % 60] = A::default_val();
            }
            self.minute_vec[sec_bucket] = in_s;
        }

        self.last_time = in_time;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type DefaultRrd = Rrd<DefaultAggregator, DefaultAggregator, DefaultAggregator>;

    #[test]
    fn test_same_second_combines() {
        let mut rrd = DefaultRrd::new();
        rrd.add_sample(1.0, 100);
        rrd.add_sample(2.0, 100);

        assert_eq!(rrd.last_time(), 100);
        assert_eq!(rrd.minute_vec()[100 % 60], 3.0);
        assert_eq!(rrd.last_value(), 3.0);
        assert_eq!(rrd.last_value_n1(), 1.0);
    }

    #[test]
    fn test_new_second_replaces() {
        let mut rrd = DefaultRrd::new();
        rrd.add_sample(5.0, 100);
        rrd.add_sample(2.0, 101);
        assert_eq!(rrd.minute_vec()[40], 5.0);
        assert_eq!(rrd.minute_vec()[41], 2.0);
        assert_eq!(rrd.last_time(), 101);
    }

    #[test]
    fn test_out_of_order_tolerance() {
        let mut rrd = DefaultRrd::new();
        rrd.add_sample(1.0, 1000);
        // within a minute: backfills
        rrd.add_sample(1.0, 990);
        assert_eq!(rrd.last_time(), 1000);
        assert_eq!(rrd.minute_vec()[990 % 60], 1.0);
        // older than a minute: discarded
        rrd.add_sample(7.0, 900);
        assert_eq!(rrd.minute_vec()[900 % 60], 0.0);
    }

    #[test]
    fn test_minute_cascade() {
        let mut rrd = DefaultRrd::new();
        for t in 0..60u64 {
            rrd.add_sample(1.0, t);
        }
        assert!(rrd.minute_vec().iter().all(|&v| v == 1.0));
        // minute 0 of the hour ring carries the mean of the full minute
        assert!((rrd.hour_vec()[0] - 1.0).abs() < 1e-9);

        rrd.add_sample(1.0, 60);
        assert!((rrd.hour_vec()[1] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_hour_gap_zero_fills() {
        let mut rrd = DefaultRrd::new();
        for t in 0..=60u64 {
            rrd.add_sample(1.0, t);
        }

        // silent until two hours in
        rrd.add_sample(1.0, 7200);

        // the minute ring holds only the new sample
        let expect_sec_avg = 1.0 / 60.0;
        assert!((rrd.hour_vec()[0] - expect_sec_avg).abs() < 1e-9);
        for m in 1..60 {
            assert_eq!(rrd.hour_vec()[m], 0.0, "minute slot {m} should be empty");
        }

        // hour 2 of the day ring carries the cascaded mean
        assert!((rrd.day_vec()[2] - expect_sec_avg / 60.0).abs() < 1e-9);
        assert_eq!(rrd.last_time(), 7200);
    }

    #[test]
    fn test_day_gap_exact_boundary_resets() {
        let mut rrd = DefaultRrd::new();
        rrd.add_sample(4.0, 1000);
        // exactly one day of silence counts as "haven't seen in a day"
        rrd.add_sample(2.0, 1000 + 86400);

        let sec_bucket = ((1000 + 86400) % 60) as usize;
        assert_eq!(rrd.minute_vec()[sec_bucket], 2.0);
        let others: f64 = rrd
            .minute_vec()
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != sec_bucket)
            .map(|(_, v)| *v)
            .sum();
        assert_eq!(others, 0.0);
    }

    #[test]
    fn test_peak_signal_aggregator() {
        assert_eq!(PeakSignalAggregator::combine(0.0, -40.0), -40.0);
        assert_eq!(PeakSignalAggregator::combine(-60.0, -40.0), -40.0);
        // empty slots are not averaged in
        let mut v = [0.0f64; 60];
        v[3] = -50.0;
        v[10] = -70.0;
        assert_eq!(PeakSignalAggregator::combine_vector(&v), -60.0);
        assert_eq!(PeakSignalAggregator::combine_vector(&[0.0; 60]), 0.0);
    }

    #[test]
    fn test_extreme_aggregator() {
        assert_eq!(ExtremeAggregator::combine(-80.0, -20.0), -80.0);
        assert_eq!(ExtremeAggregator::combine(5.0, 9.0), 9.0);
        assert_eq!(ExtremeAggregator::combine(-3.0, 9.0), -3.0);
        assert_eq!(ExtremeAggregator::combine(0.0, 9.0), 9.0);
    }

    #[test]
    fn test_prev_pos_extreme_vector() {
        let mut v = [0.0f64; 60];
        v[0] = 4.0;
        v[1] = 11.0;
        v[2] = -20.0;
        assert_eq!(PrevPosExtremeAggregator::combine_vector(&v), 11.0);
    }

    #[test]
    fn test_minute_rrd_wipe_on_gap() {
        let mut rrd: MinuteRrd = MinuteRrd::new();
        rrd.add_sample(3.0, 10);
        rrd.add_sample(5.0, 200);
        assert_eq!(rrd.minute_vec()[200 % 60], 5.0);
        let sum: f64 = rrd.minute_vec().iter().sum();
        assert_eq!(sum, 5.0);
    }

    #[test]
    fn test_to_element_serializes() {
        let reg = EntryTracker::new();
        crate::serialize::register_default_serializers(&reg);

        let mut rrd = DefaultRrd::new();
        rrd.add_sample(2.0, 30);
        let elem = rrd.to_element(&reg).unwrap();

        let mut buf = Vec::new();
        reg.serialize("json", &mut buf, &elem, None).unwrap();
        let out = String::from_utf8(buf).unwrap();
        assert!(out.contains("\"radiowatch.common.rrd.last_time\": 30"));
        assert!(out.contains("\"radiowatch.common.rrd.minute_vec\":"));
    }
}
