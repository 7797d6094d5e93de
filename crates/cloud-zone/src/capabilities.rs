//! Capability flattening/aggregation for `get_zone_capabilities`.
//!
//! A zone's raw capability report is nested `{service: {host: {cap:
//! value}}}` — one entry per compute host the child zone itself
//! manages. `flatten` collapses a zone's hosts into a single
//! `"<service>_<cap>"` -> summed-value map (the zone's total capacity
//! for that capability); `aggregate` then reduces every active zone's
//! flattened map into a `(min, max)` pair per key, the range a
//! scheduler needs to place a request that must fit in every zone it
//! could land in.

use std::collections::HashMap;

use cloud_core::model::Zone;

/// `{service: {host: {capability: value}}}`, as reported by a zone's API.
pub type NestedCapabilities = HashMap<String, HashMap<String, HashMap<String, f64>>>;

/// Collapses a zone's per-host capability report into `"<service>_<cap>"
/// -> summed value` — the zone's aggregate capacity for that capability
/// across all hosts it currently reports.
pub fn flatten(nested: &NestedCapabilities) -> HashMap<String, f64> {
    let mut flat: HashMap<String, f64> = HashMap::new();
    for (service, hosts) in nested {
        for caps in hosts.values() {
            for (cap, value) in caps {
                let key = format!("{service}_{cap}");
                *flat.entry(key).or_insert(0.0) += value;
            }
        }
    }
    flat
}

/// Reduces the flattened capability maps of every active, non-disabled
/// zone into a `(min, max)` pair per key. A key only present in some
/// zones is treated as `0.0` in the zones missing it, so a scheduler
/// reading the aggregate never over-commits to a zone that doesn't
/// report the capability at all.
pub fn aggregate(zones: &[Zone]) -> HashMap<String, (f64, f64)> {
    let active: Vec<&Zone> = zones.iter().filter(|z| z.is_active).collect();
    let mut keys: std::collections::HashSet<&str> = std::collections::HashSet::new();
    for z in &active {
        keys.extend(z.capabilities.keys().map(|k| k.as_str()));
    }

    let mut result = HashMap::new();
    for key in keys {
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for z in &active {
            let value = z.capabilities.get(key).copied().unwrap_or(0.0);
            min = min.min(value);
            max = max.max(value);
        }
        result.insert(key.to_string(), (min, max));
    }
    result
}
