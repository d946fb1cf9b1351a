//! Custom-domain verification: the pure decision function and the
//! instructions surfaced to customers.

use std::fmt;
use std::net::Ipv4Addr;

use crate::dns::ResolvedRecords;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyMethod {
    A,
    Cname,
}

impl fmt::Display for VerifyMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            VerifyMethod::A => "A",
            VerifyMethod::Cname => "CNAME",
        })
    }
}

/// Outcome of one verification attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub verified: bool,
    pub method: Option<VerifyMethod>,
    pub error: Option<String>,
}

impl Verdict {
    fn ok(method: VerifyMethod) -> Self {
        Self {
            verified: true,
            method: Some(method),
            error: None,
        }
    }

    fn fail(error: impl Into<String>) -> Self {
        Self {
            verified: false,
            method: None,
            error: Some(error.into()),
        }
    }
}

/// Lowercase, trailing dot stripped.
fn canonicalize(hostname: &str) -> String {
    hostname.trim_end_matches('.').to_ascii_lowercase()
}

/// Pure verification decision. Either method suffices:
///
/// - **CNAME**: the canonicalized target equals the deployment's
///   auto-domain.
/// - **A**: the resolved IPv4 set is non-empty and every address belongs to
///   the node's expected set.
pub fn verify(records: &ResolvedRecords, auto_domain: &str, expected_ips: &[Ipv4Addr]) -> Verdict {
    if let Some(target) = &records.cname {
        if canonicalize(target) == canonicalize(auto_domain) {
            return Verdict::ok(VerifyMethod::Cname);
        }
    }

    if !records.a.is_empty() && !expected_ips.is_empty() {
        if records.a.iter().all(|ip| expected_ips.contains(ip)) {
            return Verdict::ok(VerifyMethod::A);
        }
        return Verdict::fail(format!(
            "A records {:?} do not match the node addresses",
            records.a
        ));
    }

    match &records.cname {
        Some(target) => Verdict::fail(format!(
            "CNAME points at {} instead of {}",
            canonicalize(target),
            canonicalize(auto_domain)
        )),
        None => Verdict::fail("no A or CNAME records found"),
    }
}

/// Write a verdict onto a stored domain entry. Returns whether the domain
/// just dropped from verified to failed.
pub fn apply_verdict(
    domain: &mut hoster_store::model::DeploymentDomain,
    verdict: &Verdict,
    now: chrono::DateTime<chrono::Utc>,
) -> bool {
    use hoster_store::model::VerificationStatus;

    domain.last_checked_at = Some(now);
    if verdict.verified {
        domain.verification_status = VerificationStatus::Verified;
        domain.verified_method = verdict.method.map(|m| m.to_string());
        domain.verified_at = Some(now);
        domain.last_check_error = None;
        false
    } else {
        let dropped = domain.verification_status == VerificationStatus::Verified;
        domain.verification_status = VerificationStatus::Failed;
        domain.verified_method = None;
        domain.last_check_error = verdict.error.clone();
        dropped
    }
}

/// The ordered list of acceptable DNS setups shown to the customer for an
/// unverified domain: CNAME first, then A.
pub fn instructions(hostname: &str, auto_domain: &str, node_ip: Option<Ipv4Addr>) -> Vec<String> {
    let mut out = vec![format!("CNAME {hostname} -> {auto_domain}")];
    if let Some(ip) = node_ip {
        out.push(format!("A {hostname} -> {ip}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const AUTO: &str = "shop-ab12cd34.apps.example.com";

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[test]
    fn cname_match_verifies() {
        let records = ResolvedRecords {
            a: vec![],
            cname: Some("Shop-AB12CD34.Apps.Example.Com.".to_string()),
        };
        let verdict = verify(&records, AUTO, &[]);
        assert!(verdict.verified);
        assert_eq!(verdict.method, Some(VerifyMethod::Cname));
    }

    #[test]
    fn a_subset_verifies() {
        let records = ResolvedRecords {
            a: vec![ip("203.0.113.10")],
            cname: None,
        };
        let verdict = verify(&records, AUTO, &[ip("203.0.113.10"), ip("203.0.113.11")]);
        assert!(verdict.verified);
        assert_eq!(verdict.method, Some(VerifyMethod::A));
    }

    #[test]
    fn foreign_a_record_fails() {
        let records = ResolvedRecords {
            a: vec![ip("198.51.100.1")],
            cname: None,
        };
        let verdict = verify(&records, AUTO, &[ip("203.0.113.10")]);
        assert!(!verdict.verified);
        assert!(verdict.error.is_some());
    }

    #[test]
    fn mixed_a_records_fail_when_any_is_foreign() {
        let records = ResolvedRecords {
            a: vec![ip("203.0.113.10"), ip("198.51.100.1")],
            cname: None,
        };
        assert!(!verify(&records, AUTO, &[ip("203.0.113.10")]).verified);
    }

    #[test]
    fn wrong_cname_fails_with_target_in_error() {
        let records = ResolvedRecords {
            a: vec![],
            cname: Some("other.example.net".to_string()),
        };
        let verdict = verify(&records, AUTO, &[ip("203.0.113.10")]);
        assert!(!verdict.verified);
        assert!(verdict.error.unwrap().contains("other.example.net"));
    }

    #[test]
    fn cname_wins_even_with_matching_a() {
        // A CNAME to the auto-domain also resolves A records through it;
        // the method reported should be CNAME.
        let records = ResolvedRecords {
            a: vec![ip("203.0.113.10")],
            cname: Some(AUTO.to_string()),
        };
        let verdict = verify(&records, AUTO, &[ip("203.0.113.10")]);
        assert_eq!(verdict.method, Some(VerifyMethod::Cname));
    }

    #[test]
    fn no_records_fails() {
        let verdict = verify(&ResolvedRecords::default(), AUTO, &[ip("203.0.113.10")]);
        assert!(!verdict.verified);
    }

    #[test]
    fn instructions_ordered_cname_first() {
        let lines = instructions("shop.example.com", AUTO, Some(ip("203.0.113.10")));
        assert_eq!(
            lines,
            vec![
                format!("CNAME shop.example.com -> {AUTO}"),
                "A shop.example.com -> 203.0.113.10".to_string(),
            ]
        );
    }
}
