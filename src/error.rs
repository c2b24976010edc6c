use thiserror::Error;

use crate::key::Key;

#[derive(Debug, Error)]
pub enum TsugiteError {
    #[error("no provider found for key '{0}'")]
    UnsatisfiedRequirement(Key),

    #[error("multiple equally specific providers for key '{key}': {}", .candidates.join(", "))]
    AmbiguousProvider { key: Key, candidates: Vec<String> },

    #[error("type variable '{variable}' of provider '{provider}' cannot be inferred from the request")]
    UnboundTypeVar { provider: String, variable: String },

    #[error("invalid provider: {0}")]
    InvalidProvider(String),

    #[error("value of type '{value_type}' cannot be assigned to key '{key}'")]
    KeyTypeMismatch { key: Key, value_type: String },

    #[error("cycle detected in task graph: {}", fmt_cycle(.0))]
    Cycle(Vec<Key>),

    #[error("key '{0}' is not present in this task graph")]
    KeyNotInGraph(Key),

    #[error("provider '{provider}' failed: {source}")]
    Userland {
        provider: String,
        #[source]
        source: anyhow::Error,
    },
}

fn fmt_cycle(path: &[Key]) -> String {
    path.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_lists_path() {
        let err = TsugiteError::Cycle(vec![Key::of::<i64>(), Key::of::<f64>(), Key::of::<i64>()]);
        assert_eq!(
            err.to_string(),
            "cycle detected in task graph: i64 -> f64 -> i64"
        );
    }

    #[test]
    fn test_userland_preserves_source() {
        let err = TsugiteError::Userland {
            provider: "broken".into(),
            source: anyhow::anyhow!("boom"),
        };
        assert!(err.to_string().contains("broken"));
        assert!(err.to_string().contains("boom"));
    }
}
