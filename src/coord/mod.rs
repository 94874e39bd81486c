//! Coordination between bot processes sharing the same chats.
//!
//! Processes never talk to each other directly. They share two directories:
//! claim files decide who answers an event, and bus files let each process
//! see what the others said. Everything else here is process-local.

pub mod bus;
pub mod claim;
pub mod engagement;
pub mod extract;
pub mod history;
pub mod memory;
pub mod nudge;

pub use bus::{Bus, BusCursor, BusRecord, FileBus};
pub use claim::{ClaimKey, ClaimStore, FileClaimStore};
pub use engagement::{Decision, EngagementPolicy, EngagementRegistry, Inbound, MentionDetector, ToolHint, Verdict};
pub use history::{Content, HistoryEntry, HistoryStore, Role};
pub use memory::{MemoryBus, MemoryClaimStore};
pub use nudge::{ActiveHours, MorningPrompt, NudgeGate, NudgeSkip, PromptRotation};
