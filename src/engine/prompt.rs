//! Dispatch prompt assembly.
//!
//! The prompt hands the worker CLI everything it needs about the project,
//! phase, and task in one self-contained text block delivered on stdin.

use super::model::{ContractKind, Phase, ProjectState, Task};

/// Build the prompt for dispatching `task` within `phase`.
#[must_use]
pub fn build_dispatch_prompt(
    state: &ProjectState,
    phase: &Phase,
    task: &Task,
    contracts: &[ContractKind],
    resume: bool,
) -> String {
    let mut prompt = String::new();

    prompt.push_str(&format!(
        "# Task: {}\n\nProject: {}\nPhase: {} (branch: {}, status: {})\nTask id: {}\n\n",
        task.title, state.project_name, phase.name, phase.branch_name, phase.status, task.id
    ));

    prompt.push_str("## Description\n\n");
    prompt.push_str(&task.description);
    prompt.push_str("\n\n");

    if !task.dependencies.is_empty() {
        prompt.push_str("## Completed prerequisites\n\n");
        for dep_id in &task.dependencies {
            if let Some((_, dep)) = state.find_task(dep_id) {
                prompt.push_str(&format!("- {} ({})\n", dep.title, dep.id));
            }
        }
        prompt.push('\n');
    }

    if !contracts.is_empty() {
        prompt.push_str("## Required side effects\n\n");
        prompt.push_str("The task is only complete once these are observable:\n");
        for contract in contracts {
            let line = match contract {
                ContractKind::PrCreation => "- a pull request exists for this phase's branch",
                ContractKind::RemotePush => "- the branch is pushed to the remote",
                ContractKind::CiTriggeredUpdate => "- CI has been triggered for the latest commit",
            };
            prompt.push_str(line);
            prompt.push('\n');
        }
        prompt.push('\n');
    }

    if resume {
        prompt.push_str(
            "## Resume\n\nA previous attempt at this task failed; continue from the \
             existing session state rather than starting over.\n\n",
        );
    }

    prompt.push_str(&format!(
        "Work only on branch '{}'. Commit incrementally with clear messages.\n",
        phase.branch_name
    ));

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::model::TaskStatus;

    fn fixture() -> (ProjectState, Phase, Task) {
        let mut state = ProjectState::new("demo", "/repo");
        let mut phase = Phase::new("p1", "Auth", "feature/auth");
        let mut dep = Task::new("t0", "Scaffold module", "set things up");
        dep.status = TaskStatus::Done;
        let mut task = Task::new("t1", "Add login", "Implement the login flow");
        task.dependencies.push("t0".into());
        phase.tasks.push(dep);
        phase.tasks.push(task.clone());
        state.phases.push(phase.clone());
        (state, phase, task)
    }

    #[test]
    fn test_prompt_carries_task_context() {
        let (state, phase, task) = fixture();
        let prompt = build_dispatch_prompt(&state, &phase, &task, &[], false);
        assert!(prompt.contains("Add login"));
        assert!(prompt.contains("Implement the login flow"));
        assert!(prompt.contains("feature/auth"));
        assert!(prompt.contains("demo"));
    }

    #[test]
    fn test_prompt_lists_dependencies() {
        let (state, phase, task) = fixture();
        let prompt = build_dispatch_prompt(&state, &phase, &task, &[], false);
        assert!(prompt.contains("Scaffold module"));
    }

    #[test]
    fn test_prompt_lists_required_side_effects() {
        let (state, phase, task) = fixture();
        let prompt = build_dispatch_prompt(
            &state,
            &phase,
            &task,
            &[ContractKind::PrCreation, ContractKind::RemotePush],
            false,
        );
        assert!(prompt.contains("pull request exists"));
        assert!(prompt.contains("pushed to the remote"));
        assert!(!prompt.contains("CI has been triggered"));
    }

    #[test]
    fn test_prompt_resume_section() {
        let (state, phase, task) = fixture();
        let fresh = build_dispatch_prompt(&state, &phase, &task, &[], false);
        let resumed = build_dispatch_prompt(&state, &phase, &task, &[], true);
        assert!(!fresh.contains("## Resume"));
        assert!(resumed.contains("## Resume"));
        assert!(resumed.contains("previous attempt"));
    }
}
