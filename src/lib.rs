//! Tilekiln: vector tile generation, storage and serving backed by PostGIS.

pub mod bulk;
pub mod config;
pub mod error;
pub mod generator;
pub mod geomath;
pub mod metrics;
pub mod server;
pub mod serving;
pub mod startup;
pub mod storage;
pub mod tile;
pub mod tileset;
