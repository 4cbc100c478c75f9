pub mod errors;
pub mod ids;
pub mod line;
pub mod sink;

pub use errors::{BridgeError, SendError};
pub use ids::ClientId;
pub use line::LogLine;
pub use sink::{CollectingSink, LineSink, NullSink};
