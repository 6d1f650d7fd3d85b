// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-device location records.
//!
//! Three shapes: a bare triplet (lat/lon/alt/fix/time, valid once there is a
//! 2d fix), a full sample (triplet plus motion), and the aggregate record a
//! device carries (min corner, max corner, running average, last sample).
//! The running average accumulates scaled integers instead of floats so
//! millions of samples cannot creep; on overflow danger it rebases to the
//! current average.
//!
//! The historic RRD keeps three cascading 100-slot rings (raw, hundreds,
//! ten-thousands of samples).  Cascading averages positions as unit vectors
//! and reprojects, which behaves at the antimeridian where naive lat/lon
//! averaging does not.

use crate::element::{scalar, Element, ElementError, ElementRef, KeyedMap, TrackedElement};
use crate::fields::{ElementBuilder, EntryTracker};
use crate::ElementType;

const PRECISION_MULTIPLIER: f64 = 10000.0;
// Top nibble guard: rebase the running average before any sum can reach it.
const MAX_SIZE_MASK: i64 = 0xF000_0000_0000_0000u64 as i64;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LocationTriplet {
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
    pub fix: u8,
    pub time_sec: u64,
}

impl LocationTriplet {
    pub fn new(lat: f64, lon: f64, alt: f64, fix: u8) -> Self {
        LocationTriplet {
            lat,
            lon,
            alt,
            fix,
            time_sec: 0,
        }
    }

    /// A triplet is usable once it carries at least a 2d fix.
    pub fn valid(&self) -> bool {
        self.fix >= 2
    }
}

/// Triplet plus motion, as delivered by a GPS sub-block.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LocationFull {
    pub triplet: LocationTriplet,
    pub speed: f64,
    pub heading: f64,
    pub magnetic_heading: f64,
}

/// Aggregate location on a tracked record.
#[derive(Debug, Clone, Default)]
pub struct LocationAggregate {
    pub valid: bool,
    pub fix: u8,
    pub min_loc: Option<LocationTriplet>,
    pub max_loc: Option<LocationTriplet>,
    pub avg_loc: Option<LocationTriplet>,
    pub last_loc: Option<LocationFull>,

    agg_lat: i64,
    agg_lon: i64,
    agg_alt: i64,
    num_avg: i64,
    num_alt_avg: i64,
}

impl LocationAggregate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_loc(&mut self, loc: &LocationFull) {
        let lat = loc.triplet.lat;
        let lon = loc.triplet.lon;
        let alt = loc.triplet.alt;
        let fix = loc.triplet.fix;

        self.valid = true;
        if fix > self.fix {
            self.fix = fix;
        }

        self.last_loc = Some(*loc);

        let min = self.min_loc.get_or_insert_with(LocationTriplet::default);
        if lat < min.lat || min.lat == 0.0 {
            min.lat = lat;
        }
        if lon < min.lon || min.lon == 0.0 {
            min.lon = lon;
        }

        let max = self.max_loc.get_or_insert_with(LocationTriplet::default);
        if lat > max.lat || max.lat == 0.0 {
            max.lat = lat;
        }
        if lon > max.lon || max.lon == 0.0 {
            max.lon = lon;
        }

        if fix > 2 {
            let min = self.min_loc.get_or_insert_with(LocationTriplet::default);
            if alt < min.alt || min.alt == 0.0 {
                min.alt = alt;
            }
            let max = self.max_loc.get_or_insert_with(LocationTriplet::default);
            if alt > max.alt || max.alt == 0.0 {
                max.alt = alt;
            }
        }

        self.agg_lat += (lat * PRECISION_MULTIPLIER) as i64;
        self.agg_lon += (lon * PRECISION_MULTIPLIER) as i64;
        self.num_avg += 1;

        if fix > 2 {
            self.agg_alt += (alt * PRECISION_MULTIPLIER) as i64;
            self.num_alt_avg += 1;
        }

        let calc_lat = (self.agg_lat / self.num_avg) as f64 / PRECISION_MULTIPLIER;
        let calc_lon = (self.agg_lon / self.num_avg) as f64 / PRECISION_MULTIPLIER;
        let calc_alt = if self.num_alt_avg != 0 {
            (self.agg_alt / self.num_alt_avg) as f64 / PRECISION_MULTIPLIER
        } else {
            0.0
        };

        self.avg_loc = Some(LocationTriplet {
            lat: calc_lat,
            lon: calc_lon,
            alt: calc_alt,
            fix: 3,
            time_sec: loc.triplet.time_sec,
        });

        // Rebase long before any counter can overflow; we trade the oldest
        // history for a cheap mask compare.
        if (self.agg_lat & MAX_SIZE_MASK) != 0
            || (self.agg_lon & MAX_SIZE_MASK) != 0
            || (self.agg_alt & MAX_SIZE_MASK) != 0
            || (self.num_avg & MAX_SIZE_MASK) != 0
            || (self.num_alt_avg & MAX_SIZE_MASK) != 0
        {
            self.agg_lat = (calc_lat * PRECISION_MULTIPLIER) as i64;
            self.agg_lon = (calc_lon * PRECISION_MULTIPLIER) as i64;
            self.agg_alt = (calc_alt * PRECISION_MULTIPLIER) as i64;
            self.num_avg = 1;
            self.num_alt_avg = 1;
        }
    }

    pub fn to_element(&self, registry: &EntryTracker) -> Result<ElementRef, ElementError> {
        fn triplet_element(
            registry: &EntryTracker,
            name: &str,
            t: &LocationTriplet,
        ) -> Result<ElementRef, ElementError> {
            let f_map = registry.register_field(
                name,
                ElementBuilder::Type(ElementType::Map),
                "location triplet",
            )?;
            let f_geopoint = registry.register_field(
                "radiowatch.common.location.geopoint",
                ElementBuilder::Type(ElementType::PairDouble),
                "[lon, lat] point",
            )?;
            let f_alt = registry.register_field(
                "radiowatch.common.location.alt",
                ElementBuilder::Type(ElementType::F64),
                "altitude (meters)",
            )?;
            let f_fix = registry.register_field(
                "radiowatch.common.location.fix",
                ElementBuilder::Type(ElementType::U8),
                "gps fix",
            )?;
            let f_time = registry.register_field(
                "radiowatch.common.location.time_sec",
                ElementBuilder::Type(ElementType::U64),
                "timestamp (seconds)",
            )?;

            let mut m = KeyedMap::new();
            m.entries.insert(
                f_geopoint,
                scalar(f_geopoint, Element::PairDouble(t.lon, t.lat)),
            );
            m.entries.insert(f_alt, scalar(f_alt, Element::F64(t.alt)));
            m.entries.insert(f_fix, scalar(f_fix, Element::U8(t.fix)));
            m.entries
                .insert(f_time, scalar(f_time, Element::U64(t.time_sec)));
            Ok(TrackedElement::new(f_map, Element::Map(m)).into_ref())
        }

        let f_map = registry.register_field(
            "radiowatch.common.location",
            ElementBuilder::Type(ElementType::Map),
            "location record",
        )?;
        let f_valid = registry.register_field(
            "radiowatch.common.location.loc_valid",
            ElementBuilder::Type(ElementType::U8),
            "location data valid",
        )?;
        let f_fix = registry.register_field(
            "radiowatch.common.location.loc_fix",
            ElementBuilder::Type(ElementType::U8),
            "location fix precision (2d/3d)",
        )?;

        let mut m = KeyedMap::new();
        m.entries.insert(
            f_valid,
            scalar(f_valid, Element::U8(self.valid as u8)),
        );
        m.entries.insert(f_fix, scalar(f_fix, Element::U8(self.fix)));

        if let Some(min) = &self.min_loc {
            let e = triplet_element(registry, "radiowatch.common.location.min_loc", min)?;
            let id = match e.read() {
                Ok(g) => g.id(),
                Err(p) => p.into_inner().id(),
            };
            m.entries.insert(id, e);
        }
        if let Some(max) = &self.max_loc {
            let e = triplet_element(registry, "radiowatch.common.location.max_loc", max)?;
            let id = match e.read() {
                Ok(g) => g.id(),
                Err(p) => p.into_inner().id(),
            };
            m.entries.insert(id, e);
        }
        if let Some(avg) = &self.avg_loc {
            let e = triplet_element(registry, "radiowatch.common.location.avg_loc", avg)?;
            let id = match e.read() {
                Ok(g) => g.id(),
                Err(p) => p.into_inner().id(),
            };
            m.entries.insert(id, e);
        }
        if let Some(last) = &self.last_loc {
            let e = triplet_element(
                registry,
                "radiowatch.common.location.last_loc",
                &last.triplet,
            )?;
            let id = match e.read() {
                Ok(g) => g.id(),
                Err(p) => p.into_inner().id(),
            };
            m.entries.insert(id, e);
        }

        Ok(TrackedElement::new(f_map, Element::Map(m)).into_ref())
    }
}

/// One point in the historic ring.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HistoricLocation {
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
    pub heading: f64,
    pub speed: f64,
    pub signal: f64,
    pub frequency: f64,
    pub time_sec: u64,
}

/// Spherical average of a set of historic points: positions become unit
/// vectors, the mean vector reprojects to lat/lon.  Altitude and signal
/// average only the non-empty samples.
fn aggregate_samples(samples: &[HistoricLocation]) -> HistoricLocation {
    let n = samples.len().max(1) as f64;

    let mut avg_x = 0.0;
    let mut avg_y = 0.0;
    let mut avg_z = 0.0;
    let mut avg_alt = 0.0;
    let mut num_alt = 0.0;
    let mut heading = 0.0;
    let mut speed = 0.0;
    let mut signal = 0.0;
    let mut num_signal = 0.0;
    let mut timesec = 0.0;
    let mut frequency = 0.0;

    for g in samples {
        let mod_lat = g.lat.to_radians();
        let mod_lon = g.lon.to_radians();

        avg_x += mod_lat.cos() * mod_lon.cos();
        avg_y += mod_lat.cos() * mod_lon.sin();
        avg_z += mod_lat.sin();

        if g.alt != 0.0 {
            avg_alt += g.alt;
            num_alt += 1.0;
        }

        heading += g.heading;
        speed += g.speed;

        if g.signal != 0.0 {
            signal += g.signal;
            num_signal += 1.0;
        }

        timesec += g.time_sec as f64;
        frequency += g.frequency;
    }

    let r_x = avg_x / n;
    let r_y = avg_y / n;
    let r_z = avg_z / n;

    let central_lon = r_y.atan2(r_x);
    let central_sqr = (r_x * r_x + r_y * r_y).sqrt();
    let central_lat = r_z.atan2(central_sqr);

    HistoricLocation {
        lat: central_lat.to_degrees(),
        lon: central_lon.to_degrees(),
        alt: if num_alt > 0.0 { avg_alt / num_alt } else { 0.0 },
        heading: heading / n,
        speed: speed / n,
        signal: if num_signal > 0.0 {
            signal / num_signal
        } else {
            0.0
        },
        frequency: frequency / n,
        time_sec: (timesec / n) as u64,
    }
}

const RING_CAP: usize = 100;

/// Historic location rings: raw samples, 100-sample aggregates, and
/// 10k-sample aggregates, covering 100 / 10k / 1m samples of history.
#[derive(Debug, Default)]
pub struct HistoricLocationRrd {
    samples_100: Vec<HistoricLocation>,
    samples_10k: Vec<HistoricLocation>,
    samples_1m: Vec<HistoricLocation>,
    cascade_100: usize,
    cascade_10k: usize,
}

impl HistoricLocationRrd {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn samples_100(&self) -> &[HistoricLocation] {
        &self.samples_100
    }

    pub fn samples_10k(&self) -> &[HistoricLocation] {
        &self.samples_10k
    }

    pub fn samples_1m(&self) -> &[HistoricLocation] {
        &self.samples_1m
    }

    pub fn add_sample(&mut self, sample: HistoricLocation) {
        self.samples_100.push(sample);
        if self.samples_100.len() > RING_CAP {
            self.samples_100.remove(0);
        }

        self.cascade_100 += 1;
        if self.cascade_100 >= RING_CAP {
            self.cascade_100 = 0;
            let agg = aggregate_samples(&self.samples_100);

            self.samples_10k.push(agg);
            if self.samples_10k.len() > RING_CAP {
                self.samples_10k.remove(0);
            }

            self.cascade_10k += 1;
            if self.cascade_10k >= RING_CAP {
                self.cascade_10k = 0;
                let agg = aggregate_samples(&self.samples_10k);

                self.samples_1m.push(agg);
                if self.samples_1m.len() > RING_CAP {
                    self.samples_1m.remove(0);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_triplet_validity() {
        assert!(!LocationTriplet::new(1.0, 2.0, 0.0, 0).valid());
        assert!(!LocationTriplet::new(1.0, 2.0, 0.0, 1).valid());
        assert!(LocationTriplet::new(1.0, 2.0, 0.0, 2).valid());
        assert!(LocationTriplet::new(1.0, 2.0, 5.0, 3).valid());
    }

    fn full(lat: f64, lon: f64, alt: f64, fix: u8) -> LocationFull {
        LocationFull {
            triplet: LocationTriplet::new(lat, lon, alt, fix),
            speed: 0.0,
            heading: 0.0,
            magnetic_heading: 0.0,
        }
    }

    #[test]
    fn test_aggregate_min_max_avg() {
        let mut agg = LocationAggregate::new();
        agg.add_loc(&full(10.0, 20.0, 0.0, 2));
        agg.add_loc(&full(12.0, 18.0, 0.0, 2));

        let min = agg.min_loc.unwrap();
        let max = agg.max_loc.unwrap();
        let avg = agg.avg_loc.unwrap();

        assert_eq!(min.lat, 10.0);
        assert_eq!(min.lon, 18.0);
        assert_eq!(max.lat, 12.0);
        assert_eq!(max.lon, 20.0);
        assert!((avg.lat - 11.0).abs() < 1e-3);
        assert!((avg.lon - 19.0).abs() < 1e-3);
        assert_eq!(agg.last_loc.unwrap().triplet.lat, 12.0);
    }

    #[test]
    fn test_aggregate_alt_requires_3d_fix() {
        let mut agg = LocationAggregate::new();
        agg.add_loc(&full(1.0, 1.0, 100.0, 2));
        assert_eq!(agg.avg_loc.unwrap().alt, 0.0);

        agg.add_loc(&full(1.0, 1.0, 100.0, 3));
        assert!((agg.avg_loc.unwrap().alt - 100.0).abs() < 1e-3);
        assert_eq!(agg.fix, 3);
    }

    #[test]
    fn test_aggregate_rebase_keeps_average() {
        let mut agg = LocationAggregate::new();
        // Force the accumulators toward the guard band to trigger a rebase.
        agg.agg_lat = MAX_SIZE_MASK - 1;
        agg.agg_lon = 1;
        agg.num_avg = 1;

        agg.add_loc(&full(45.0, 45.0, 0.0, 2));
        // post-rebase state is a single averaged sample
        assert_eq!(agg.num_avg, 1);
        assert!(agg.agg_lat < MAX_SIZE_MASK);
    }

    #[test]
    fn test_spherical_average_at_antimeridian() {
        let samples = vec![
            HistoricLocation {
                lat: 0.0,
                lon: 179.0,
                ..Default::default()
            },
            HistoricLocation {
                lat: 0.0,
                lon: -179.0,
                ..Default::default()
            },
        ];
        let agg = aggregate_samples(&samples);
        // naive averaging would give 0; spherical gives the short way round
        assert!((agg.lon.abs() - 180.0).abs() < 1e-6);
        assert!(agg.lat.abs() < 1e-6);
    }

    #[test]
    fn test_historic_ring_cascade() {
        let mut rrd = HistoricLocationRrd::new();
        for i in 0..250 {
            rrd.add_sample(HistoricLocation {
                lat: 10.0,
                lon: 20.0,
                signal: -50.0,
                time_sec: i,
                ..Default::default()
            });
        }

        assert_eq!(rrd.samples_100().len(), 100);
        // two full cascades at samples 100 and 200
        assert_eq!(rrd.samples_10k().len(), 2);
        assert!(rrd.samples_1m().is_empty());

        let agg = &rrd.samples_10k()[0];
        assert!((agg.lat - 10.0).abs() < 1e-6);
        assert!((agg.lon - 20.0).abs() < 1e-6);
        assert!((agg.signal + 50.0).abs() < 1e-6);
    }
}
