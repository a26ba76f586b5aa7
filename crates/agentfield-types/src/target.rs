use crate::error::ControlPlaneError;

/// A parsed `"<node_id>.<target_name>"` dispatch target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub node_id: String,
    pub target_name: String,
}

impl Target {
    /// Splits on the first dot; both sides must be non-empty.
    pub fn parse(raw: &str) -> Result<Self, ControlPlaneError> {
        let Some(dot) = raw.find('.') else {
            return Err(ControlPlaneError::BadRequest(format!(
                "target '{raw}' must be of the form '<node_id>.<target_name>'"
            )));
        };
        let (node_id, rest) = raw.split_at(dot);
        let target_name = &rest[1..];
        if node_id.is_empty() || target_name.is_empty() {
            return Err(ControlPlaneError::BadRequest(format!(
                "target '{raw}' must be of the form '<node_id>.<target_name>'"
            )));
        }
        Ok(Target {
            node_id: node_id.to_string(),
            target_name: target_name.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_first_dot_only() {
        let t = Target::parse("node-1.reasoner.extra").unwrap();
        assert_eq!(t.node_id, "node-1");
        assert_eq!(t.target_name, "reasoner.extra");
    }

    #[test]
    fn rejects_missing_dot() {
        assert!(Target::parse("node-1").is_err());
    }

    #[test]
    fn rejects_empty_sides() {
        assert!(Target::parse(".reasoner").is_err());
        assert!(Target::parse("node-1.").is_err());
    }
}
