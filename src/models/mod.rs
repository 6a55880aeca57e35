pub mod array_data;
pub mod chunks;
pub mod dataset;
pub mod key;
pub mod source;
pub mod template;

pub use array_data::{ArrayData, Element};
pub use chunks::{ChunkExtent, ChunkLayout};
pub use dataset::{DataType, Dataset, Variable, VariableSchema};
pub use key::{ChunkKey, Fragment};
pub use source::ClimatologySource;
pub use template::Template;
