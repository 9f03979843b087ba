//! Config generator seam — the collaborator that turns a task descriptor
//! into the engine's job-config document. Opaque to the pipeline: `None`
//! is the missing-dependency sentinel and becomes a pre-flight failure
//! without spawning the engine.

use crate::model::Task;

/// Produces the engine-config payload for a task.
pub trait ConfigGenerator: Send + Sync {
    fn generate(&self, task: &Task) -> Option<serde_json::Value>;
}

/// Minimal generator: wraps the task's source/target descriptors into the
/// engine's job envelope. Returns `None` when either descriptor is missing.
pub struct TemplateGenerator;

impl ConfigGenerator for TemplateGenerator {
    fn generate(&self, task: &Task) -> Option<serde_json::Value> {
        if task.source.is_null() || task.target.is_null() {
            return None;
        }
        Some(serde_json::json!({
            "job": {
                "content": [{
                    "reader": task.source,
                    "writer": task.target,
                }],
                "setting": {
                    "speed": { "channel": 1 }
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_descriptor_is_sentinel() {
        let task = Task::new("t", "0 * * * *");
        assert!(TemplateGenerator.generate(&task).is_none());
    }

    #[test]
    fn test_generates_envelope() {
        let mut task = Task::new("t", "0 * * * *");
        task.source = serde_json::json!({"name": "rdbmsreader"});
        task.target = serde_json::json!({"name": "hdfswriter"});
        let payload = TemplateGenerator.generate(&task).unwrap();
        assert_eq!(payload["job"]["content"][0]["reader"]["name"], "rdbmsreader");
    }
}
