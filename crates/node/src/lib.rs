//! GenLoop Node
//!
//! Worker node for a distributed text-generation service. The node holds
//! one persistent connection to a dispatcher, admits generation tasks into
//! a continuously re-composed batch, decodes them step by step, and
//! streams partial output back.

pub mod batch;
pub mod conn;
pub mod engine;
pub mod node;
pub mod prompt;
pub mod sampler;
pub mod stream;
pub mod task;
pub mod testing;
pub mod tokenizer;
pub mod watchdog;

pub use batch::BatchComposer;
pub use conn::{ConnectionManager, Connector, LinkTransport, TcpConnector};
pub use engine::{BatchView, LocalEngine, StepEngine};
pub use node::Node;
pub use prompt::PromptBuilder;
pub use sampler::SamplingPolicy;
pub use stream::OutputStreamer;
pub use task::{Task, TaskRegistry};
pub use tokenizer::{HfTokenizer, TokenizerService};
