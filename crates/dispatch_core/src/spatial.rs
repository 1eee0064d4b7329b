//! Driver proximity index: worker identity -> last known coordinate.
//!
//! This module provides:
//!
//! - **DriverGeoIndex**: one layer per service type, bucketed by H3 cell
//! - **Expiry**: entries not refreshed within the TTL are treated as absent
//! - **Nearby queries**: grid-disk prefilter, exact haversine filter and sort
//!
//! Default resolution is 8 (~460m edge), suitable for city-scale radii.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use h3o::{CellIndex, Resolution};

use dispatch_contract::contract::ServiceType;

use crate::clock::Clock;
use crate::geo::{haversine_km, to_lat_lng, GeoError, GeoPoint};

pub const DEFAULT_ENTRY_TTL: Duration = Duration::from_secs(300);
pub const DEFAULT_RESOLUTION: Resolution = Resolution::Eight;

/// Distances closer than this are considered equal when ordering results.
const TIE_TOLERANCE_KM: f64 = 1e-9;

/// Margin applied to the average hexagon size when sizing the search disk,
/// covering H3's cell size distortion across the globe.
const RING_SPACING_FACTOR: f64 = 1.2;

#[derive(Debug, Clone, Copy)]
pub struct GeoIndexConfig {
    pub resolution: Resolution,
    pub entry_ttl: Duration,
}

impl Default for GeoIndexConfig {
    fn default() -> Self {
        Self {
            resolution: DEFAULT_RESOLUTION,
            entry_ttl: DEFAULT_ENTRY_TTL,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeoIndexEntry {
    pub worker_id: String,
    pub service_type: ServiceType,
    pub position: GeoPoint,
    pub updated_at: DateTime<Utc>,
}

/// A query hit with its distance from the query point.
#[derive(Debug, Clone, PartialEq)]
pub struct NearbyWorker {
    pub entry: GeoIndexEntry,
    pub distance_km: f64,
}

#[derive(Debug)]
struct IndexedEntry {
    cell: CellIndex,
    entry: GeoIndexEntry,
}

/// Cell -> workers plus the reverse mapping for one service type.
#[derive(Debug, Default)]
struct ServiceLayer {
    workers_by_cell: HashMap<CellIndex, Vec<String>>,
    entries: HashMap<String, IndexedEntry>,
}

impl ServiceLayer {
    fn upsert(&mut self, cell: CellIndex, entry: GeoIndexEntry) {
        let worker_id = entry.worker_id.clone();
        match self.entries.get_mut(&worker_id) {
            Some(existing) => {
                let old_cell = existing.cell;
                existing.cell = cell;
                existing.entry = entry;
                if old_cell != cell {
                    self.detach(old_cell, &worker_id);
                    self.workers_by_cell.entry(cell).or_default().push(worker_id);
                }
            }
            None => {
                self.workers_by_cell
                    .entry(cell)
                    .or_default()
                    .push(worker_id.clone());
                self.entries.insert(worker_id, IndexedEntry { cell, entry });
            }
        }
    }

    fn remove(&mut self, worker_id: &str) -> Option<GeoIndexEntry> {
        let removed = self.entries.remove(worker_id)?;
        self.detach(removed.cell, worker_id);
        Some(removed.entry)
    }

    fn detach(&mut self, cell: CellIndex, worker_id: &str) {
        if let Some(workers) = self.workers_by_cell.get_mut(&cell) {
            workers.retain(|w| w != worker_id);
            if workers.is_empty() {
                self.workers_by_cell.remove(&cell);
            }
        }
    }
}

/// Per-service-type proximity index with expiry.
///
/// Writers race last-writer-wins: the index is a cache of "presumed online"
/// workers, never the source of truth for availability.
pub struct DriverGeoIndex {
    config: GeoIndexConfig,
    clock: Arc<dyn Clock>,
    layers: RwLock<HashMap<ServiceType, ServiceLayer>>,
}

impl DriverGeoIndex {
    pub fn new(config: GeoIndexConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            layers: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> GeoIndexConfig {
        self.config
    }

    /// Record the latest position for a worker, replacing any previous one.
    pub fn upsert(
        &self,
        worker_id: &str,
        service_type: ServiceType,
        lat: f64,
        lng: f64,
    ) -> Result<GeoIndexEntry, GeoError> {
        let position = GeoPoint { lat, lng };
        let cell = to_lat_lng(position)?.to_cell(self.config.resolution);
        let entry = GeoIndexEntry {
            worker_id: worker_id.to_string(),
            service_type,
            position,
            updated_at: self.clock.now(),
        };

        let mut layers = self.layers.write().unwrap_or_else(PoisonError::into_inner);
        layers
            .entry(service_type)
            .or_default()
            .upsert(cell, entry.clone());
        Ok(entry)
    }

    pub fn remove(&self, worker_id: &str, service_type: ServiceType) -> Option<GeoIndexEntry> {
        let mut layers = self.layers.write().unwrap_or_else(PoisonError::into_inner);
        layers.get_mut(&service_type)?.remove(worker_id)
    }

    /// Live entry for a worker, `None` if absent or expired.
    pub fn get(&self, worker_id: &str, service_type: ServiceType) -> Option<GeoIndexEntry> {
        let now = self.clock.now();
        let layers = self.layers.read().unwrap_or_else(PoisonError::into_inner);
        let indexed = layers.get(&service_type)?.entries.get(worker_id)?;
        (!self.is_expired(&indexed.entry, now)).then(|| indexed.entry.clone())
    }

    /// Workers within `radius_km` of the point, nearest first.
    ///
    /// Equidistant workers (within floating tolerance) are ordered by most
    /// recent update first. Expired entries never appear.
    pub fn query_nearby(
        &self,
        lat: f64,
        lng: f64,
        radius_km: f64,
        service_type: ServiceType,
        limit: usize,
    ) -> Result<Vec<NearbyWorker>, GeoError> {
        let origin = GeoPoint { lat, lng };
        let origin_cell = to_lat_lng(origin)?.to_cell(self.config.resolution);
        if limit == 0 || !(radius_km > 0.0) {
            return Ok(Vec::new());
        }

        let now = self.clock.now();
        let layers = self.layers.read().unwrap_or_else(PoisonError::into_inner);
        let Some(layer) = layers.get(&service_type) else {
            return Ok(Vec::new());
        };

        let mut hits: Vec<NearbyWorker> = Vec::new();
        let mut consider = |indexed: &IndexedEntry| {
            if self.is_expired(&indexed.entry, now) {
                return;
            }
            let distance_km = haversine_km(origin, indexed.entry.position);
            if distance_km <= radius_km {
                hits.push(NearbyWorker {
                    entry: indexed.entry.clone(),
                    distance_km,
                });
            }
        };

        let rings = self.rings_for_radius(radius_km);
        if disk_cell_count(rings) >= layer.workers_by_cell.len() {
            // Fewer occupied cells than the disk would visit: scan them all.
            layer.entries.values().for_each(&mut consider);
        } else {
            for cell in origin_cell.grid_disk::<Vec<_>>(rings) {
                let Some(workers) = layer.workers_by_cell.get(&cell) else {
                    continue;
                };
                for worker_id in workers {
                    if let Some(indexed) = layer.entries.get(worker_id) {
                        consider(indexed);
                    }
                }
            }
        }

        hits.sort_by_key(|hit| {
            (
                quantize(hit.distance_km),
                Reverse(hit.entry.updated_at),
                hit.entry.worker_id.clone(),
            )
        });
        hits.truncate(limit);
        Ok(hits)
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut layers = self.layers.write().unwrap_or_else(PoisonError::into_inner);
        let mut removed = 0;
        for layer in layers.values_mut() {
            let expired: Vec<String> = layer
                .entries
                .values()
                .filter(|indexed| self.is_expired(&indexed.entry, now))
                .map(|indexed| indexed.entry.worker_id.clone())
                .collect();
            for worker_id in expired {
                if layer.remove(&worker_id).is_some() {
                    removed += 1;
                }
            }
        }
        removed
    }

    /// Number of stored entries, expired or not.
    pub fn len(&self) -> usize {
        let layers = self.layers.read().unwrap_or_else(PoisonError::into_inner);
        layers.values().map(|layer| layer.entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_expired(&self, entry: &GeoIndexEntry, now: DateTime<Utc>) -> bool {
        match (now - entry.updated_at).to_std() {
            Ok(age) => age > self.config.entry_ttl,
            // Updated "in the future" relative to this clock: still fresh.
            Err(_) => false,
        }
    }

    fn rings_for_radius(&self, radius_km: f64) -> u32 {
        let edge_km = self.config.resolution.edge_length_km();
        let spacing_km = edge_km * RING_SPACING_FACTOR;
        let rings = ((radius_km + edge_km) / spacing_km).ceil() + 1.0;
        rings.min(u32::MAX as f64) as u32
    }
}

/// Number of cells in a hexagonal disk of `k` rings.
fn disk_cell_count(k: u32) -> usize {
    let k = k as usize;
    3usize.saturating_mul(k).saturating_mul(k.saturating_add(1)).saturating_add(1)
}

fn quantize(distance_km: f64) -> i64 {
    (distance_km / TIE_TOLERANCE_KM).round() as i64
}
