use serde::Serialize;

/// Resource envelope for a new instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Plan {
    pub name: &'static str,
    pub vcpus: u32,
    pub memory_mib: u64,
    pub disk_gib: u32,
}

pub const PLANS: [Plan; 4] = [
    Plan {
        name: "Starter",
        vcpus: 1,
        memory_mib: 2048,
        disk_gib: 10,
    },
    Plan {
        name: "Professional",
        vcpus: 2,
        memory_mib: 4096,
        disk_gib: 20,
    },
    Plan {
        name: "Production",
        vcpus: 4,
        memory_mib: 8192,
        disk_gib: 40,
    },
    Plan {
        name: "Beast",
        vcpus: 8,
        memory_mib: 16384,
        disk_gib: 80,
    },
];

pub const DEFAULT_PLAN: Plan = PLANS[0];

pub fn lookup(name: &str) -> Option<Plan> {
    let name = name.trim();
    PLANS.iter().copied().find(|plan| plan.name.eq_ignore_ascii_case(name))
}

/// Like [`lookup`], but an unknown name falls back to [`DEFAULT_PLAN`].
pub fn select(name: &str) -> Plan {
    if name.trim().is_empty() {
        return DEFAULT_PLAN;
    }
    lookup(name).unwrap_or_else(|| {
        tracing::warn!(plan = name, fallback = DEFAULT_PLAN.name, "unknown plan");
        DEFAULT_PLAN
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_ignores_case() {
        assert_eq!(lookup("professional").map(|p| p.vcpus), Some(2));
        assert_eq!(lookup("BEAST").map(|p| p.memory_mib), Some(16384));
        assert_eq!(lookup("Tiny"), None);
    }

    #[test]
    fn unknown_or_blank_plan_selects_starter() {
        assert_eq!(select("Gigantic"), DEFAULT_PLAN);
        assert_eq!(select(""), DEFAULT_PLAN);
        assert_eq!(select("production").disk_gib, 40);
        assert_eq!(DEFAULT_PLAN.name, "Starter");
    }
}
