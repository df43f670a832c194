pub mod checkpoint;
pub mod config;
pub mod oracle;
pub mod orchestrator;
pub mod planner;
pub mod process;
pub mod progress;
pub mod protocol;
pub mod sampler;
pub mod searcher;
pub mod sieve;
pub mod window;

pub use oracle::{MillerRabin, PrimalityOracle};
pub use orchestrator::{Orchestrator, OrchestratorConfig, RunResult, ThreadLauncher};
pub use planner::{plan, Range, Segment};
pub use protocol::WorkerEvent;
pub use searcher::{SearchOutcome, SearchSpec, SegmentSearcher, StopFlag};
pub use window::{count_primes, count_primes_capped, Direction, SlidingWindow, TARGET_PRIMES, WINDOW_WIDTH};
