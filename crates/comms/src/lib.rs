//! Transport boundary of the observatory control server: the multipart
//! envelope and its TCP codec, the front router, the request solver that
//! fans request batches into the tree, and the pub/sub messenger.

pub mod envelope;
pub mod nats;
pub mod router;
pub mod solver;

pub use envelope::{Multipart, MultipartCodec};
pub use nats::Messenger;
pub use router::Router;
pub use solver::RequestSolver;
