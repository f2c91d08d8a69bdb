use std::collections::BTreeSet;
use std::time::Duration;

use pipeline_contracts::{AdviserResponse, FailureType, PayloadType, RepairActionCode};
use serde::{Deserialize, Serialize};

use super::{repair_response, Adviser, AdvisingEvent};
use crate::error::Result;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryAdviserParameters {
    /// Attempts after the first one
    pub retry_count: u32,
    /// Wait before attempt `n` is `wait_intervals[n - 1]`; the last entry repeats
    #[serde(default)]
    pub wait_intervals: Vec<Duration>,
    /// Failure types that trigger a retry; empty matches every failure
    #[serde(default)]
    pub failure_types: BTreeSet<FailureType>,
    #[serde(default)]
    pub repair_action_on_exhaustion: RepairActionCode,
    /// Where to continue when the exhaustion action ignores the failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_node_id: Option<String>,
}

impl PayloadType for RetryAdviserParameters {
    const KIND: &'static str = "retry-adviser";
}

impl RetryAdviserParameters {
    fn wait_interval(&self, retry_index: u32) -> Duration {
        self.wait_intervals
            .get(retry_index as usize)
            .or(self.wait_intervals.last())
            .copied()
            .unwrap_or_default()
    }
}

/// Re-runs a failed node up to `retry_count` times, then applies the
/// exhaustion repair action
pub struct RetryAdviser;

impl Adviser for RetryAdviser {
    fn can_advise(&self, event: &AdvisingEvent<'_>) -> Result<bool> {
        let params: RetryAdviserParameters = event.adviser_parameters.decode_or_default()?;
        if !event.is_matching_failure(&params.failure_types) {
            return Ok(false);
        }
        Ok(event.retry_index() < params.retry_count
            || repair_response(params.repair_action_on_exhaustion, None).is_some())
    }

    fn on_advise(&self, event: &AdvisingEvent<'_>) -> Result<AdviserResponse> {
        let params: RetryAdviserParameters = event.adviser_parameters.decode_or_default()?;
        let retry_index = event.retry_index();
        if retry_index < params.retry_count {
            return Ok(AdviserResponse::Retry {
                wait_interval: params.wait_interval(retry_index),
                retry_index: retry_index + 1,
            });
        }
        log::info!(
            "Retries of '{}' exhausted after {} attempts; applying {:?}",
            event.node_execution.identifier,
            retry_index + 1,
            params.repair_action_on_exhaustion
        );
        Ok(
            repair_response(params.repair_action_on_exhaustion, params.next_node_id.as_deref())
                .unwrap_or(AdviserResponse::NextStep { next_node_id: None }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advise::testing::{node_execution, plan_node};
    use pipeline_contracts::{FailureInfo, Payload, Status};

    fn decide(
        params: &RetryAdviserParameters,
        status: Status,
        failure: FailureInfo,
        retry_index: u32,
    ) -> Option<AdviserResponse> {
        let node = plan_node();
        let execution = node_execution(status, Some(failure), retry_index);
        let parameters = Payload::encode(params).unwrap();
        let event = AdvisingEvent {
            node_execution: &execution,
            plan_node: &node,
            to_status: status,
            adviser_parameters: &parameters,
        };
        if RetryAdviser.can_advise(&event).unwrap() {
            Some(RetryAdviser.on_advise(&event).unwrap())
        } else {
            None
        }
    }

    #[test]
    fn test_retry_waits_follow_intervals() {
        let params = RetryAdviserParameters {
            retry_count: 3,
            wait_intervals: vec![Duration::from_secs(1), Duration::from_secs(5)],
            ..Default::default()
        };
        let failure = FailureInfo::new("flaky");
        let waits: Vec<_> = (0..3)
            .map(|i| match decide(&params, Status::Failed, failure.clone(), i) {
                Some(AdviserResponse::Retry {
                    wait_interval,
                    retry_index,
                }) => {
                    assert_eq!(retry_index, i + 1);
                    wait_interval
                }
                other => panic!("expected retry, got {:?}", other),
            })
            .collect();
        assert_eq!(
            waits,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(5),
                Duration::from_secs(5)
            ]
        );
        assert_eq!(decide(&params, Status::Failed, failure, 3), None);
    }

    #[test]
    fn test_failure_type_filter() {
        let params = RetryAdviserParameters {
            retry_count: 2,
            failure_types: [FailureType::Connectivity].into_iter().collect(),
            ..Default::default()
        };
        assert!(decide(&params, Status::Failed, FailureInfo::timeout("slow"), 0).is_none());
        assert!(decide(
            &params,
            Status::Errored,
            FailureInfo::new("reset").with_type(FailureType::Connectivity),
            0
        )
        .is_some());
    }

    #[test]
    fn test_exhaustion_action() {
        let params = RetryAdviserParameters {
            retry_count: 1,
            repair_action_on_exhaustion: RepairActionCode::Ignore,
            next_node_id: Some("cleanup".into()),
            ..Default::default()
        };
        assert_eq!(
            decide(&params, Status::Failed, FailureInfo::new("x"), 1),
            Some(AdviserResponse::IgnoreFailure {
                next_node_id: Some("cleanup".into())
            })
        );
    }

    #[test]
    fn test_never_retries_success() {
        let params = RetryAdviserParameters {
            retry_count: 5,
            ..Default::default()
        };
        assert!(decide(&params, Status::Succeeded, FailureInfo::new("x"), 0).is_none());
        assert!(decide(&params, Status::Aborted, FailureInfo::new("x"), 0).is_none());
    }
}
