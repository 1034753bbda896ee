// Snapshot source traits and shared backend metadata

pub mod connection;
pub mod process;
pub mod synthetic;

/// Backend priority ranking (higher = better)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BackendPriority {
    Fallback = 1, // Works but not a real measurement (synthetic)
    Good = 2,     // Spawns an external command (netstat, lsof)
    Better = 3,   // Portable library (sysinfo)
    Best = 4,     // Native kernel tables (procfs)
}

/// Backend metadata for listing and auto-selection
#[derive(Debug, Clone)]
pub struct SourceInfo {
    pub name: &'static str,
    pub priority: BackendPriority,
    pub available: bool,
}

/// Pick the best available entry, or the named one if it is listed
fn pick<'a>(infos: &'a [SourceInfo], preference: Option<&str>) -> Option<&'a SourceInfo> {
    match preference {
        Some(name) => infos.iter().find(|info| info.name == name),
        None => infos
            .iter()
            .filter(|info| info.available)
            .max_by_key(|info| info.priority),
    }
}

/// Number of network interfaces the host currently reports
pub fn count_interfaces() -> usize {
    let networks = sysinfo::Networks::new_with_refreshed_list();
    networks.list().len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn infos() -> Vec<SourceInfo> {
        vec![
            SourceInfo {
                name: "synthetic",
                priority: BackendPriority::Fallback,
                available: true,
            },
            SourceInfo {
                name: "procfs",
                priority: BackendPriority::Best,
                available: false,
            },
            SourceInfo {
                name: "netstat",
                priority: BackendPriority::Good,
                available: true,
            },
        ]
    }

    #[test]
    fn test_pick_best_available() {
        let infos = infos();
        assert_eq!(pick(&infos, None).unwrap().name, "netstat");
    }

    #[test]
    fn test_pick_by_name_ignores_priority() {
        let infos = infos();
        assert_eq!(pick(&infos, Some("synthetic")).unwrap().name, "synthetic");
        assert!(pick(&infos, Some("wfp")).is_none());
    }
}
