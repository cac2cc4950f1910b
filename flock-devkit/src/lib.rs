/*!
# Flock DevKit - stubs and harness for flock nodes

Run several nodes inside one test process:
- Stub host collaborators (apply, verify, metadata, tokens) that record calls
- Loopback adoption RPC routed straight to in-process agents
- A harness wiring nodes onto a shared in-memory discovery bus
*/

pub mod harness;
pub mod loopback;
pub mod stubs;

pub use harness::{FlockHarness, TestNode};
pub use loopback::LoopbackNetwork;
pub use stubs::{RecordingApplier, RecordingVerifier, StaticMetadata, StaticTokenIssuer};
