//! Certificate signing request records as held by the approval authority.

use serde::{Deserialize, Serialize};

/// Prefix of the common name a node requests for its client identity.
pub const NODE_IDENTITY_PREFIX: &str = "system:node:";

/// Organization every node identity belongs to.
pub const NODE_GROUP: &str = "system:nodes";

/// The identity string a node with the given name requests.
pub fn node_identity(node_name: &str) -> String {
    format!("{}{}", NODE_IDENTITY_PREFIX, node_name)
}

/// Type of a status condition on a signing request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionType {
    Approved,
    Denied,
    /// Any condition this crate does not act on.
    #[serde(other)]
    Unknown,
}

/// Condition status value that makes a condition hold.
pub const CONDITION_TRUE: &str = "True";

fn condition_true() -> String {
    CONDITION_TRUE.to_string()
}

/// One entry of a signing request's condition list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestCondition {
    #[serde(rename = "type")]
    pub kind: ConditionType,
    /// `"True"`, `"False"` or `"Unknown"`; absent means `"True"`.
    #[serde(default = "condition_true")]
    pub status: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

impl RequestCondition {
    pub fn approved(reason: impl Into<String>) -> Self {
        Self {
            kind: ConditionType::Approved,
            status: condition_true(),
            reason: reason.into(),
            message: String::new(),
        }
    }

    pub fn denied(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: ConditionType::Denied,
            status: condition_true(),
            reason: reason.into(),
            message: message.into(),
        }
    }

    /// Whether this condition of type `kind` is in effect.
    pub fn holds(&self, kind: ConditionType) -> bool {
        self.kind == kind && self.status == CONDITION_TRUE
    }
}

/// Observed status of a signing request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningRequestStatus {
    #[serde(default)]
    pub conditions: Vec<RequestCondition>,

    /// Issued certificate (PEM), present once the request is signed.
    #[serde(default)]
    pub certificate: Option<Vec<u8>>,
}

/// Outcome of evaluating one status snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// No terminal condition yet.
    Pending,

    /// A certificate has been issued.
    Approved {
        certificate: Vec<u8>,
        /// False when the certificate arrived without an `Approved` condition.
        condition_present: bool,
    },

    /// The request was denied; terminal.
    Denied { reason: String, message: String },
}

impl SigningRequestStatus {
    /// Evaluate this snapshot.
    ///
    /// A `Denied` condition wins over `Approved` regardless of list order.
    /// A non-empty certificate is success even when no condition is present.
    pub fn decision(&self) -> Decision {
        if let Some(denied) = self
            .conditions
            .iter()
            .find(|c| c.holds(ConditionType::Denied))
        {
            return Decision::Denied {
                reason: denied.reason.clone(),
                message: denied.message.clone(),
            };
        }

        let condition_present = self
            .conditions
            .iter()
            .any(|c| c.holds(ConditionType::Approved));

        match &self.certificate {
            Some(certificate) if !certificate.is_empty() => Decision::Approved {
                certificate: certificate.clone(),
                condition_present,
            },
            _ => Decision::Pending,
        }
    }
}

/// A signing request record owned by the approval authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningRequestRecord {
    /// Name assigned by the authority.
    pub name: String,

    /// PEM-encoded PKCS#10 request.
    pub request: Vec<u8>,

    #[serde(default)]
    pub status: SigningRequestStatus,
}

impl SigningRequestRecord {
    pub fn decision(&self) -> Decision {
        self.status.decision()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(conditions: Vec<RequestCondition>, cert: Option<&[u8]>) -> SigningRequestStatus {
        SigningRequestStatus {
            conditions,
            certificate: cert.map(|c| c.to_vec()),
        }
    }

    #[test]
    fn test_node_identity() {
        assert_eq!(node_identity("worker-1"), "system:node:worker-1");
    }

    #[test]
    fn test_empty_status_is_pending() {
        assert_eq!(SigningRequestStatus::default().decision(), Decision::Pending);
    }

    #[test]
    fn test_approved_without_certificate_is_pending() {
        let s = status(vec![RequestCondition::approved("AutoApproved")], None);
        assert_eq!(s.decision(), Decision::Pending);

        let s = status(vec![RequestCondition::approved("AutoApproved")], Some(b""));
        assert_eq!(s.decision(), Decision::Pending);
    }

    #[test]
    fn test_approved_with_certificate() {
        let s = status(vec![RequestCondition::approved("AutoApproved")], Some(b"cert"));
        assert_eq!(
            s.decision(),
            Decision::Approved {
                certificate: b"cert".to_vec(),
                condition_present: true,
            }
        );
    }

    #[test]
    fn test_certificate_without_condition_is_approved() {
        let s = status(vec![], Some(b"cert"));
        assert_eq!(
            s.decision(),
            Decision::Approved {
                certificate: b"cert".to_vec(),
                condition_present: false,
            }
        );
    }

    #[test]
    fn test_denied_takes_precedence_in_either_order() {
        let approved = RequestCondition::approved("AutoApproved");
        let denied = RequestCondition::denied("PolicyViolation", "node not allowed");

        for conditions in [
            vec![approved.clone(), denied.clone()],
            vec![denied.clone(), approved.clone()],
        ] {
            let s = status(conditions, Some(b"cert"));
            assert_eq!(
                s.decision(),
                Decision::Denied {
                    reason: "PolicyViolation".to_string(),
                    message: "node not allowed".to_string(),
                }
            );
        }
    }

    #[test]
    fn test_conditions_that_do_not_hold_are_ignored() {
        let json = r#"{"conditions":[
            {"type":"Approved","status":"False","reason":"Pending"},
            {"type":"Denied","status":"False","reason":"NotYet"}
        ]}"#;
        let s: SigningRequestStatus = serde_json::from_str(json).unwrap();
        assert_eq!(s.decision(), Decision::Pending);

        let mut with_cert = s.clone();
        with_cert.certificate = Some(b"cert".to_vec());
        assert_eq!(
            with_cert.decision(),
            Decision::Approved {
                certificate: b"cert".to_vec(),
                condition_present: false,
            }
        );
    }

    #[test]
    fn test_missing_condition_status_holds() {
        let json = r#"{"conditions":[{"type":"Denied","reason":"PolicyViolation"}]}"#;
        let s: SigningRequestStatus = serde_json::from_str(json).unwrap();
        assert_eq!(s.conditions[0].status, "True");
        assert!(matches!(s.decision(), Decision::Denied { .. }));
    }

    #[test]
    fn test_unknown_condition_type_deserializes() {
        let json = r#"{"conditions":[{"type":"Failed","reason":"x"}],"certificate":null}"#;
        let s: SigningRequestStatus = serde_json::from_str(json).unwrap();
        assert_eq!(s.conditions[0].kind, ConditionType::Unknown);
        assert_eq!(s.decision(), Decision::Pending);
    }
}
