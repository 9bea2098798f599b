pub mod error;
pub mod models;

pub use error::{Error, Result};
pub use models::{
    Conversation, ConversationTurn, EmotionalState, InteractionState, Memory, MemorableMoment,
    MemoryType, Persona, Priority, Relationship, RelationshipType, ResponseType, Visibility,
    canonical_pair, unix_now,
};
