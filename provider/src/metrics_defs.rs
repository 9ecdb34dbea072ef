//! Metrics definitions for the provider.

use shared::metrics_defs::{MetricDef, MetricType};

pub const DISCOVERY_INSTANCES: MetricDef = MetricDef {
    name: "discovery.instances",
    metric_type: MetricType::Gauge,
    description: "Number of instances reported by a discovery source in the last cycle",
};

pub const DISCOVERY_INSTANCES_SKIPPED: MetricDef = MetricDef {
    name: "discovery.instances.skipped",
    metric_type: MetricType::Counter,
    description: "Number of instances whose whole contribution was skipped",
};

pub const DISCOVERY_FETCH_ERRORS: MetricDef = MetricDef {
    name: "discovery.fetch.errors",
    metric_type: MetricType::Counter,
    description: "Number of cycles skipped because the discovery source failed",
};

pub const BUILD_SERVICE_ERRORS: MetricDef = MetricDef {
    name: "build.service.errors",
    metric_type: MetricType::Counter,
    description: "Number of services abandoned while building an instance configuration",
};

pub const BUILD_ROUTER_ERRORS: MetricDef = MetricDef {
    name: "build.router.errors",
    metric_type: MetricType::Counter,
    description: "Number of routers abandoned while building an instance configuration",
};

pub const MERGE_CONFLICTS: MetricDef = MetricDef {
    name: "merge.conflicts",
    metric_type: MetricType::Counter,
    description: "Number of entities dropped because instances disagreed on their definition",
};

pub const CYCLE_DURATION: MetricDef = MetricDef {
    name: "cycle.duration",
    metric_type: MetricType::Histogram,
    description: "Time to fetch, build and merge one cycle in seconds",
};

pub const METADATA_CACHE_HIT: MetricDef = MetricDef {
    name: "metadata_cache.hit",
    metric_type: MetricType::Counter,
    description: "Number of label decodes served from the metadata cache",
};

pub const METADATA_CACHE_MISS: MetricDef = MetricDef {
    name: "metadata_cache.miss",
    metric_type: MetricType::Counter,
    description: "Number of label decodes that missed the metadata cache",
};

pub const ALL_METRICS: &[MetricDef] = &[
    DISCOVERY_INSTANCES,
    DISCOVERY_INSTANCES_SKIPPED,
    DISCOVERY_FETCH_ERRORS,
    BUILD_SERVICE_ERRORS,
    BUILD_ROUTER_ERRORS,
    MERGE_CONFLICTS,
    CYCLE_DURATION,
    METADATA_CACHE_HIT,
    METADATA_CACHE_MISS,
];
