//! Pure signal-detection over a support company's usage metrics against
//! its plan's configured limits. No I/O; takes plain numbers in, returns
//! plain data out, so the thresholds in spec §8 property 9 are directly
//! testable with literal inputs.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Critical,
    Warning,
    Info,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signal {
    pub name: &'static str,
    pub priority: Priority,
}

const APPROACHING_RATIO: f64 = 0.8;
const POWER_USER_PROJECT_THRESHOLD: u32 = 100;

/// Plan limits looked up from `MEMBER_LIMIT_TABLE` for a company's plan.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlanLimits {
    pub members: u32,
    pub projects: u32,
}

pub fn detect_signals(members: u32, active_projects: u32, limits: PlanLimits) -> Vec<Signal> {
    let mut signals = Vec::new();

    if limits.members > 0 {
        if members >= limits.members {
            signals.push(Signal { name: "team_at_capacity", priority: Priority::Critical });
        } else if members as f64 >= limits.members as f64 * APPROACHING_RATIO {
            signals.push(Signal { name: "team_approaching_capacity", priority: Priority::Warning });
        }
    }

    if active_projects >= POWER_USER_PROJECT_THRESHOLD {
        signals.push(Signal { name: "power_user", priority: Priority::Info });
    }

    if limits.projects > 0 && active_projects < limits.projects {
        if active_projects as f64 >= limits.projects as f64 * APPROACHING_RATIO {
            signals.push(Signal { name: "approaching_project_limit", priority: Priority::Warning });
        }
    } else if limits.projects > 0 && active_projects >= limits.projects {
        signals.push(Signal { name: "project_at_capacity", priority: Priority::Critical });
    }

    signals
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn members_at_limit_is_critical_team_at_capacity() {
        let signals = detect_signals(25, 0, PlanLimits { members: 25, projects: 0 });
        assert_eq!(signals, vec![Signal { name: "team_at_capacity", priority: Priority::Critical }]);
    }

    #[test]
    fn members_at_eighty_percent_is_approaching_capacity() {
        let signals = detect_signals(20, 0, PlanLimits { members: 25, projects: 0 });
        assert_eq!(signals, vec![Signal { name: "team_approaching_capacity", priority: Priority::Warning }]);
    }

    #[test]
    fn members_below_eighty_percent_fires_no_capacity_signal() {
        let signals = detect_signals(16, 0, PlanLimits { members: 25, projects: 0 });
        assert!(signals.is_empty());
    }

    #[test]
    fn high_absolute_project_usage_fires_power_user_not_approaching_limit() {
        let signals = detect_signals(0, 110, PlanLimits { members: 0, projects: 1000 });
        assert_eq!(signals, vec![Signal { name: "power_user", priority: Priority::Info }]);
    }

    #[test]
    fn projects_at_eighty_percent_of_limit_fires_approaching() {
        let signals = detect_signals(0, 800, PlanLimits { members: 0, projects: 1000 });
        assert!(signals.iter().any(|s| s.name == "approaching_project_limit"));
    }
}
