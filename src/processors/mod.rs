pub mod dispatcher;
pub mod pipeline;
pub mod selector;
pub mod time_grid;

pub use dispatcher::ChunkDispatcher;
pub use pipeline::{ExpansionPipeline, ExpansionPlan, ExpansionSummary};
pub use selector::{select_climatology, ClimatologySelector, Fragments};
pub use time_grid::{Periodicity, TimeGrid};
