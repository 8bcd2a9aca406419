//! Eligibility matching of tasks to agents.
//!
//! Matching is a pure read over a snapshot of agent state. Two callers may
//! pick the same agent for different tasks; the claim step decides who wins.

use crate::{Agent, Task, TaskStatus};

/// Select the agent that should be offered `task`.
///
/// Eligible agents are `available` and have a complexity range containing
/// `task.complexity`. Among them the least-recently-used one (oldest
/// `last_active`) wins, with the agent id as a final tie-break so the result
/// is reproducible for a given snapshot.
///
/// Returns `None` when the task is not waiting for an agent or nobody fits.
pub fn find_candidate<'a>(task: &Task, agents: &'a [Agent]) -> Option<&'a Agent> {
    if task.status != TaskStatus::NotStarted {
        return None;
    }

    agents
        .iter()
        .filter(|agent| agent.can_take(task.complexity))
        .min_by(|a, b| {
            a.last_active
                .cmp(&b.last_active)
                .then_with(|| a.id.cmp(&b.id))
        })
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::*;
    use crate::{AgentId, AgentStatus, ComplexityRange};

    fn agent(id: &str, min: u8, max: u8, idle_minutes: i64) -> Agent {
        Agent::new("model", "http://agent", ComplexityRange::new(min, max).unwrap())
            .with_id(AgentId::new(id))
            .with_last_active(Utc::now() - Duration::minutes(idle_minutes))
    }

    #[test]
    fn test_picks_agent_whose_range_fits() {
        let task = Task::new("t1", "", 5);
        let agents = vec![agent("a2", 6, 10, 60), agent("a1", 1, 5, 1)];

        let picked = find_candidate(&task, &agents).unwrap();
        assert_eq!(picked.id.as_str(), "a1");
    }

    #[test]
    fn test_least_recently_used_wins() {
        let task = Task::new("t1", "", 3);
        let agents = vec![
            agent("recent", 1, 10, 1),
            agent("oldest", 1, 10, 30),
            agent("middle", 1, 10, 10),
        ];

        assert_eq!(find_candidate(&task, &agents).unwrap().id.as_str(), "oldest");
    }

    #[test]
    fn test_id_breaks_timestamp_ties() {
        let task = Task::new("t1", "", 3);
        let at = Utc::now();
        let agents = vec![
            agent("b", 1, 10, 0).with_last_active(at),
            agent("a", 1, 10, 0).with_last_active(at),
        ];

        assert_eq!(find_candidate(&task, &agents).unwrap().id.as_str(), "a");
    }

    #[test]
    fn test_skips_busy_and_offline_agents() {
        let task = Task::new("t1", "", 3);
        let mut busy = agent("busy", 1, 10, 50);
        busy.status = AgentStatus::Busy;
        let mut offline = agent("offline", 1, 10, 40);
        offline.status = AgentStatus::Offline;
        let agents = vec![busy, offline, agent("free", 1, 10, 0)];

        assert_eq!(find_candidate(&task, &agents).unwrap().id.as_str(), "free");
    }

    #[test]
    fn test_none_when_no_range_covers_complexity() {
        let task = Task::new("hard", "", 9);
        let agents = vec![agent("a1", 1, 5, 10)];
        assert!(find_candidate(&task, &agents).is_none());
    }

    #[test]
    fn test_none_for_claimed_task() {
        let mut task = Task::new("t1", "", 3);
        task.status = TaskStatus::Design;
        let agents = vec![agent("a1", 1, 5, 10)];
        assert!(find_candidate(&task, &agents).is_none());
    }
}
