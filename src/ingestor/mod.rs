//! Event Ingestor (spec §4.3): the component table's "consumes JetStream
//! subjects for Treasury/Pay/IntentManager V1+V2, normalises payloads,
//! writes idempotent event rows, dispatches to handlers" plus subgraph
//! catch-up for gaps.

pub mod consumer;
pub mod envelope;
pub mod subgraph;

pub use consumer::{ingest_event, IngestorConsumer, IngestorDeps};
pub use subgraph::{SubgraphPoller, SubgraphTarget};
