//! Typed ID definitions for every store-issued entity in the data model.

use crate::define_id;

define_id!(NodeId);
define_id!(EnrollmentRequestId);
define_id!(ApiKeyId);
define_id!(IpPoolId);
define_id!(IpAllocationId);
define_id!(LinkAllocationId);
define_id!(WireGuardInterfaceId);
define_id!(NodePeerId);
define_id!(NodeConfigId);
define_id!(SshKeyId);
define_id!(NodeCommandId);
define_id!(EventId);
define_id!(AuditLogId);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_through_string() {
        let id = NodeId::new(7);
        let s = id.to_string();
        assert_eq!(s, "7");
        let parsed: NodeId = s.parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn roundtrips_through_json() {
        let id = NodeId::new(42);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "42");
        let parsed: NodeId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn rejects_non_positive() {
        assert!(NodeId::parse("0").is_err());
        assert!(NodeId::parse("-3").is_err());
        assert!(serde_json::from_str::<NodeId>("0").is_err());
    }

    #[test]
    fn rejects_garbage() {
        assert!(NodeId::parse("abc").is_err());
        assert!(NodeId::parse("").is_err());
    }
}
