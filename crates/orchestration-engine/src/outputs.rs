//! Sweeping outputs and outcomes
//!
//! Data a node publishes for later nodes. An output is written once into a
//! scope, which is a level of the writer's ambiance: by default its own
//! level, or the innermost enclosing level tagged with a group name (e.g.
//! `STAGE`), so that siblings inside that group can read it. A second
//! write to the same scope and name fails with `DuplicateOutput`; nothing
//! is ever overwritten.
//!
//! Reads walk the reader's levels from the innermost outwards and return
//! the first match, then fall back to the plan-wide scope.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use pipeline_contracts::{Ambiance, Payload, PayloadType, RefKind};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::persistence::{impl_entity, Repository};

/// Scope id of outputs visible to the whole plan run
const PLAN_SCOPE: &str = "-";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredOutput {
    /// `{kind}/{plan_execution_id}/{scope}/{name}`
    pub uuid: String,
    pub plan_execution_id: String,
    pub kind: RefKind,
    pub name: String,
    /// Runtime id of the owning level, or `-` for plan scope
    pub scope: String,
    #[serde(default)]
    pub group: Option<String>,
    pub value: Payload,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub version: u64,
}

impl_entity!(StoredOutput, "outputs");

fn kind_prefix(kind: RefKind) -> &'static str {
    match kind {
        RefKind::SweepingOutput => "output",
        RefKind::Outcome => "outcome",
    }
}

fn output_key(kind: RefKind, plan_execution_id: &str, scope: &str, name: &str) -> String {
    format!("{}/{}/{}/{}", kind_prefix(kind), plan_execution_id, scope, name)
}

pub struct OutputService {
    repo: Arc<dyn Repository<StoredOutput>>,
    compression_threshold: usize,
}

impl OutputService {
    pub fn new(repo: Arc<dyn Repository<StoredOutput>>, compression_threshold: usize) -> Self {
        Self {
            repo,
            compression_threshold,
        }
    }

    /// Scope a write lands in
    fn write_scope(ambiance: &Ambiance, group: Option<&str>) -> Result<String> {
        match group {
            None => Ok(ambiance
                .current_runtime_id()
                .unwrap_or(PLAN_SCOPE)
                .to_string()),
            Some(group) => ambiance
                .level_in_group(group)
                .map(|level| level.runtime_id.clone())
                .ok_or_else(|| {
                    EngineError::invalid(format!(
                        "no level in group '{}' at {}",
                        group,
                        ambiance.fqn()
                    ))
                }),
        }
    }

    /// Write an output; fails if the scope already has one with this name
    pub fn consume(
        &self,
        kind: RefKind,
        ambiance: &Ambiance,
        name: &str,
        value: Payload,
        group: Option<&str>,
    ) -> Result<StoredOutput> {
        let scope = Self::write_scope(ambiance, group)?;
        let output = StoredOutput {
            uuid: output_key(kind, &ambiance.plan_execution_id, &scope, name),
            plan_execution_id: ambiance.plan_execution_id.clone(),
            kind,
            name: name.to_string(),
            scope: scope.clone(),
            group: group.map(str::to_string),
            value,
            created_at: Utc::now(),
            version: 0,
        };
        match self.repo.insert(&output) {
            Ok(stored) => {
                log::debug!("Stored {} '{}' in scope '{}'", kind_prefix(kind), name, scope);
                Ok(stored)
            }
            Err(EngineError::DuplicateKey { .. }) => Err(EngineError::DuplicateOutput {
                name: name.to_string(),
                scope,
            }),
            Err(e) => Err(e),
        }
    }

    /// Write an output unless one already exists; `None` means it existed
    pub fn consume_optional(
        &self,
        kind: RefKind,
        ambiance: &Ambiance,
        name: &str,
        value: Payload,
        group: Option<&str>,
    ) -> Result<Option<StoredOutput>> {
        match self.consume(kind, ambiance, name, value, group) {
            Ok(stored) => Ok(Some(stored)),
            Err(EngineError::DuplicateOutput { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Encode and write a typed value, compressing large payloads
    pub fn consume_value<T: PayloadType>(
        &self,
        kind: RefKind,
        ambiance: &Ambiance,
        name: &str,
        value: &T,
        group: Option<&str>,
    ) -> Result<StoredOutput> {
        let payload = Payload::encode_compressed_above(value, self.compression_threshold)?;
        self.consume(kind, ambiance, name, payload, group)
    }

    /// Nearest output named `name` visible from `ambiance`
    pub fn resolve_optional(
        &self,
        kind: RefKind,
        ambiance: &Ambiance,
        name: &str,
    ) -> Result<Option<Payload>> {
        let scopes = ambiance
            .levels
            .iter()
            .rev()
            .map(|level| level.runtime_id.as_str())
            .chain(std::iter::once(PLAN_SCOPE));
        for scope in scopes {
            let key = output_key(kind, &ambiance.plan_execution_id, scope, name);
            if let Some(output) = self.repo.get(&key)? {
                return Ok(Some(output.value));
            }
        }
        Ok(None)
    }

    pub fn resolve(&self, kind: RefKind, ambiance: &Ambiance, name: &str) -> Result<Payload> {
        self.resolve_optional(kind, ambiance, name)?
            .ok_or_else(|| EngineError::OutputNotFound {
                name: name.to_string(),
            })
    }

    pub fn resolve_value<T: PayloadType>(
        &self,
        kind: RefKind,
        ambiance: &Ambiance,
        name: &str,
    ) -> Result<T> {
        Ok(self.resolve(kind, ambiance, name)?.decode()?)
    }

    /// All outputs of a plan run, in write order
    pub fn list_for_plan(&self, plan_execution_id: &str) -> Result<Vec<StoredOutput>> {
        self.repo.find_by_plan_execution(plan_execution_id)
    }

    pub fn delete_for_plan(&self, plan_execution_id: &str) -> Result<usize> {
        self.repo.delete_by_plan_execution(plan_execution_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryRepository;
    use pipeline_contracts::{Level, StepCategory, StepType};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Artifact {
        image: String,
    }

    impl PayloadType for Artifact {
        const KIND: &'static str = "artifact";
    }

    fn level(id: &str, category: StepCategory, group: Option<&str>) -> Level {
        Level {
            setup_id: id.to_string(),
            runtime_id: format!("rt-{}", id),
            identifier: id.to_string(),
            step_type: StepType::new(id, category),
            retry_index: 0,
            group: group.map(str::to_string),
        }
    }

    fn stage() -> Ambiance {
        Ambiance::new("exec", "plan")
            .clone_for_child(level("pipeline", StepCategory::Pipeline, Some("PIPELINE")))
            .clone_for_child(level("deploy", StepCategory::Stage, Some("STAGE")))
    }

    fn service() -> OutputService {
        OutputService::new(Arc::new(MemoryRepository::new()), 1024)
    }

    fn artifact(image: &str) -> Artifact {
        Artifact {
            image: image.to_string(),
        }
    }

    #[test]
    fn test_write_once_per_scope() {
        let outputs = service();
        let step = stage().clone_for_child(level("build", StepCategory::Step, None));
        outputs
            .consume_value(RefKind::SweepingOutput, &step, "artifact", &artifact("v1"), None)
            .unwrap();

        let err = outputs
            .consume_value(RefKind::SweepingOutput, &step, "artifact", &artifact("v2"), None)
            .unwrap_err();
        assert!(matches!(err, EngineError::DuplicateOutput { .. }));

        let kept = outputs
            .consume_optional(
                RefKind::SweepingOutput,
                &step,
                "artifact",
                Payload::encode(&artifact("v3")).unwrap(),
                None,
            )
            .unwrap();
        assert!(kept.is_none());

        let value: Artifact = outputs
            .resolve_value(RefKind::SweepingOutput, &step, "artifact")
            .unwrap();
        assert_eq!(value, artifact("v1"));
    }

    #[test]
    fn test_group_scope_is_visible_to_siblings() {
        let outputs = service();
        let build = stage().clone_for_child(level("build", StepCategory::Step, None));
        let deploy = stage().clone_for_child(level("rollout", StepCategory::Step, None));

        outputs
            .consume_value(RefKind::SweepingOutput, &build, "private", &artifact("p"), None)
            .unwrap();
        outputs
            .consume_value(RefKind::SweepingOutput, &build, "shared", &artifact("s"), Some("STAGE"))
            .unwrap();

        assert!(outputs
            .resolve_optional(RefKind::SweepingOutput, &deploy, "private")
            .unwrap()
            .is_none());
        let shared: Artifact = outputs
            .resolve_value(RefKind::SweepingOutput, &deploy, "shared")
            .unwrap();
        assert_eq!(shared.image, "s");

        // Outcomes live in their own namespace
        assert!(matches!(
            outputs.resolve(RefKind::Outcome, &deploy, "shared").unwrap_err(),
            EngineError::OutputNotFound { .. }
        ));
    }

    #[test]
    fn test_unknown_group_is_rejected() {
        let outputs = service();
        let err = outputs
            .consume_value(RefKind::Outcome, &stage(), "x", &artifact("x"), Some("STEP_GROUP"))
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidRequest(_)));
    }
}
