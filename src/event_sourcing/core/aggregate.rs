use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Aggregate Identity
// ============================================================================
//
// An aggregate identifier names one ordering domain: one append-only event
// log and one queue discriminator. It never changes once an event refers
// to it.
//
// ============================================================================

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ContextIdentifier {
    pub name: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
pub struct AggregateReference {
    pub name: String,
    pub id: Uuid,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
pub struct AggregateIdentifier {
    pub context: ContextIdentifier,
    pub aggregate: AggregateReference,
}

impl AggregateIdentifier {
    pub fn new(context_name: impl Into<String>, aggregate_name: impl Into<String>, id: Uuid) -> Self {
        Self {
            context: ContextIdentifier {
                name: context_name.into(),
            },
            aggregate: AggregateReference {
                name: aggregate_name.into(),
                id,
            },
        }
    }

    pub fn id(&self) -> Uuid {
        self.aggregate.id
    }

    pub fn context_name(&self) -> &str {
        &self.context.name
    }

    pub fn aggregate_name(&self) -> &str {
        &self.aggregate.name
    }

    /// Queue discriminator for work targeting this aggregate.
    pub fn discriminator(&self) -> String {
        self.aggregate.id.to_string()
    }
}

impl std::fmt::Display for AggregateIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.context.name, self.aggregate.name, self.aggregate.id)
    }
}
