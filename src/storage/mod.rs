pub mod corpus;

pub use corpus::{CorpusStats, CorpusStorage, StaleEntry};
