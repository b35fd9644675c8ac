use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::commit::CommitInfo;

/// A bug ticket resolved against release ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    pub key: String,
    pub created: DateTime<Utc>,
    pub resolved: DateTime<Utc>,
    /// Opening version
    pub ov: u32,
    /// Fix version
    pub fv: u32,
    /// Injection version reported by the tracker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iv: Option<u32>,
    #[serde(default, skip_serializing)]
    pub commits: Vec<CommitInfo>,
}

impl Ticket {
    pub fn has_reported_iv(&self) -> bool {
        self.iv.is_some()
    }

    /// Reported IV, or the proportion estimate when the tracker gave none.
    pub fn injection_version(&self, proportion: f64) -> u32 {
        self.iv
            .unwrap_or_else(|| estimate_iv(self.ov, self.fv, proportion))
    }
}

/// `fv - p * (fv - ov)`, or `fv - p` when both versions coincide.
/// Truncated toward zero and clamped to 1.
pub fn estimate_iv(ov: u32, fv: u32, proportion: f64) -> u32 {
    let fv_f = f64::from(fv);
    let raw = if fv == ov {
        fv_f - proportion
    } else {
        fv_f - proportion * (fv_f - f64::from(ov))
    };
    let truncated = raw.trunc();
    if truncated < 1.0 { 1 } else { truncated as u32 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_iv_standard() {
        assert_eq!(estimate_iv(4, 10, 0.5), 7);
    }

    #[test]
    fn test_estimate_iv_same_versions() {
        assert_eq!(estimate_iv(5, 5, 2.15), 2);
    }

    #[test]
    fn test_estimate_iv_clamped_to_one() {
        assert_eq!(estimate_iv(1, 3, 2.15), 1);
        assert_eq!(estimate_iv(2, 2, 5.0), 1);
    }

    #[test]
    fn test_reported_iv_wins() {
        let t = Ticket {
            key: "PRJ-1".into(),
            created: Utc::now(),
            resolved: Utc::now(),
            ov: 3,
            fv: 5,
            iv: Some(2),
            commits: vec![],
        };
        assert_eq!(t.injection_version(10.0), 2);
        assert!(t.has_reported_iv());
    }
}
