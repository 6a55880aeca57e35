//! Zarr directory stores through `zarrs`: climatologies are read lazily from
//! v2 or v3 groups, expansions are written as v3 groups with xarray-compatible
//! dimension names.

pub mod chunk_sink;
pub mod reader;
pub mod writer;

pub use chunk_sink::ChunkSink;
pub use reader::{inspect, open, ArraySummary, StoreSummary, ZarrClimatology};
pub use writer::{write_dataset, ArraySpec, StoreWriter};
