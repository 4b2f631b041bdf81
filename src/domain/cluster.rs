use serde::{Deserialize, Serialize};

/// Devices solved jointly. The cluster's power is the sum of its members'.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EssCluster {
    id: String,
    members: Vec<String>,
}

impl EssCluster {
    /// Returns `None` for an empty member list.
    pub fn new(id: impl Into<String>, members: Vec<String>) -> Option<Self> {
        if members.is_empty() {
            return None;
        }
        Some(Self {
            id: id.into(),
            members,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn members(&self) -> &[String] {
        &self.members
    }

    pub fn contains(&self, ess_id: &str) -> bool {
        self.members.iter().any(|m| m == ess_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_cluster_rejected() {
        assert!(EssCluster::new("ess0", vec![]).is_none());
    }

    #[test]
    fn test_cluster_membership() {
        let cluster = EssCluster::new("ess0", vec!["ess1".into(), "ess2".into()]).unwrap();
        assert_eq!(cluster.id(), "ess0");
        assert!(cluster.contains("ess2"));
        assert!(!cluster.contains("ess3"));
    }
}
