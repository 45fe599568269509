//! Completion-side-effect contracts and verification probes.
//!
//! A task whose text claims an externally observable side effect (a PR, a
//! push, a CI update) earns a contract for it. After the worker exits
//! successfully, each contract is probed independently; verification passes
//! only if every probe succeeds, and a failed verification is authoritative
//! over the exit code — exit 0 is not proof the side effect happened.

use std::sync::OnceLock;

use chrono::Utc;
use regex::Regex;

use super::model::{
    CompletionVerification, ContractKind, Phase, VerificationProbe, VerificationStatus,
};
use crate::dispatch::GitProbe;

fn pr_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Word-boundary match so "approach" or "print" never reads as a PR claim.
    RE.get_or_init(|| Regex::new(r"(?i)\b(prs?|pull requests?)\b").expect("valid regex"))
}

fn push_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\bpush(es|ed|ing)?\b").expect("valid regex"))
}

fn ci_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\bci\b").expect("valid regex"))
}

/// Derive the completion contracts a task earns from its title and
/// description. May be empty.
#[must_use]
pub fn derive_contracts(title: &str, description: &str) -> Vec<ContractKind> {
    let text = format!("{title} {description}");
    let mut contracts = Vec::new();
    if pr_pattern().is_match(&text) {
        contracts.push(ContractKind::PrCreation);
    }
    if push_pattern().is_match(&text) {
        contracts.push(ContractKind::RemotePush);
    }
    if ci_pattern().is_match(&text) {
        contracts.push(ContractKind::CiTriggeredUpdate);
    }
    contracts
}

/// Probe every contract independently against the current phase state and
/// the git remote. Overall status is PASSED only if every probe succeeds.
pub async fn verify_contracts(
    phase: &Phase,
    contracts: &[ContractKind],
    git: &dyn GitProbe,
) -> CompletionVerification {
    let mut probes = Vec::with_capacity(contracts.len());
    let mut missing = Vec::new();

    for contract in contracts {
        let probe = match contract {
            ContractKind::PrCreation => match &phase.pr_url {
                Some(url) => VerificationProbe {
                    name: "pr_url_set".into(),
                    success: true,
                    details: format!("phase has PR URL {url}"),
                },
                None => VerificationProbe {
                    name: "pr_url_set".into(),
                    success: false,
                    details: "phase has no PR URL".into(),
                },
            },
            ContractKind::RemotePush => match git.branch_pushed(&phase.branch_name).await {
                Ok(true) => VerificationProbe {
                    name: "branch_pushed".into(),
                    success: true,
                    details: format!("branch '{}' exists on the remote", phase.branch_name),
                },
                Ok(false) => VerificationProbe {
                    name: "branch_pushed".into(),
                    success: false,
                    details: format!("branch '{}' not found on the remote", phase.branch_name),
                },
                Err(e) => VerificationProbe {
                    name: "branch_pushed".into(),
                    success: false,
                    details: format!("remote probe failed: {e}"),
                },
            },
            ContractKind::CiTriggeredUpdate => match &phase.ci_status_context {
                Some(ctx) => VerificationProbe {
                    name: "ci_signal_present".into(),
                    success: true,
                    details: format!("phase has CI signal: {ctx}"),
                },
                None => VerificationProbe {
                    name: "ci_signal_present".into(),
                    success: false,
                    details: "phase has no CI signal".into(),
                },
            },
        };

        if !probe.success {
            missing.push(format!("{contract}: {}", probe.details));
        }
        probes.push(probe);
    }

    let status = if missing.is_empty() {
        VerificationStatus::Passed
    } else {
        VerificationStatus::Failed
    };

    CompletionVerification {
        checked_at: Utc::now(),
        contracts: contracts.to_vec(),
        status,
        probes,
        missing_side_effects: missing,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::MockGitProbe;

    #[test]
    fn test_derive_pr_contract() {
        assert_eq!(
            derive_contracts("Create PR for feature", ""),
            vec![ContractKind::PrCreation]
        );
        assert_eq!(
            derive_contracts("Open a pull request", ""),
            vec![ContractKind::PrCreation]
        );
    }

    #[test]
    fn test_derive_push_contract() {
        assert_eq!(
            derive_contracts("Push the branch", ""),
            vec![ContractKind::RemotePush]
        );
        assert_eq!(
            derive_contracts("", "commit and push everything upstream"),
            vec![ContractKind::RemotePush]
        );
    }

    #[test]
    fn test_derive_ci_contract() {
        assert_eq!(
            derive_contracts("Fix CI", ""),
            vec![ContractKind::CiTriggeredUpdate]
        );
    }

    #[test]
    fn test_derive_multiple_contracts() {
        let contracts = derive_contracts("Create PR", "push the branch and wait for CI");
        assert_eq!(
            contracts,
            vec![
                ContractKind::PrCreation,
                ContractKind::RemotePush,
                ContractKind::CiTriggeredUpdate
            ]
        );
    }

    #[test]
    fn test_derive_no_contract_from_ordinary_words() {
        // "pr" inside a word, "ci" inside a word, "pushy" word-boundary edge.
        assert!(derive_contracts("Improve the approach", "principled circuit design").is_empty());
        assert!(derive_contracts("Refactor parser", "print cleaner output").is_empty());
    }

    #[test]
    fn test_derive_case_insensitive() {
        assert_eq!(
            derive_contracts("create pr for login", ""),
            vec![ContractKind::PrCreation]
        );
    }

    #[tokio::test]
    async fn test_verify_all_probes_pass() {
        let mut phase = Phase::new("p1", "Auth", "feature/auth");
        phase.pr_url = Some("https://github.com/acme/demo/pull/7".into());
        phase.ci_status_context = Some("checks: passing".into());
        let git = MockGitProbe::default();

        let verification = verify_contracts(
            &phase,
            &[
                ContractKind::PrCreation,
                ContractKind::RemotePush,
                ContractKind::CiTriggeredUpdate,
            ],
            &git,
        )
        .await;

        assert_eq!(verification.status, VerificationStatus::Passed);
        assert_eq!(verification.probes.len(), 3);
        assert!(verification.missing_side_effects.is_empty());
        assert!(verification.probes.iter().all(|p| p.success));
    }

    #[tokio::test]
    async fn test_verify_missing_pr_fails() {
        let phase = Phase::new("p1", "Auth", "feature/auth");
        let git = MockGitProbe::default();

        let verification =
            verify_contracts(&phase, &[ContractKind::PrCreation], &git).await;
        assert_eq!(verification.status, VerificationStatus::Failed);
        assert_eq!(verification.missing_side_effects.len(), 1);
        assert!(verification.missing_side_effects[0].contains("PR_CREATION"));
    }

    #[tokio::test]
    async fn test_verify_probes_run_independently() {
        // One failing probe must not stop the others from being collected.
        let mut phase = Phase::new("p1", "Auth", "feature/auth");
        phase.ci_status_context = Some("checks: passing".into());
        let git = MockGitProbe::default();
        git.set_branch_pushed(false);

        let verification = verify_contracts(
            &phase,
            &[
                ContractKind::PrCreation,
                ContractKind::RemotePush,
                ContractKind::CiTriggeredUpdate,
            ],
            &git,
        )
        .await;

        assert_eq!(verification.status, VerificationStatus::Failed);
        assert_eq!(verification.probes.len(), 3);
        assert_eq!(verification.missing_side_effects.len(), 2);
        assert!(verification.probes[2].success); // CI probe still ran
    }

    #[tokio::test]
    async fn test_verify_empty_contracts_passes() {
        let phase = Phase::new("p1", "Auth", "feature/auth");
        let git = MockGitProbe::default();
        let verification = verify_contracts(&phase, &[], &git).await;
        assert_eq!(verification.status, VerificationStatus::Passed);
        assert!(verification.probes.is_empty());
    }
}
